use super::*;

#[test]
fn test_heap_buffer() {
    HeapFactory::unlink("test_heap_buffer");

    let factory = HeapFactory::new();
    let buf = factory.create("test_heap_buffer_0", 100).unwrap();
    assert_eq!(buf.to_name(), "test_heap_buffer_0");
    // rounded up to the next 8-byte multiple
    assert_eq!(buf.len(), 104);

    // fresh buffers are zero-filled
    let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
    assert!(bytes.iter().all(|b| *b == 0));
}

#[test]
fn test_heap_attach() {
    HeapFactory::unlink("test_heap_attach");

    let factory = HeapFactory::new();
    let buf1 = factory.create("test_heap_attach_0", 64).unwrap();
    unsafe { buf1.as_ptr().write(0xAB) };

    // same name attaches to the same bytes
    let buf2 = factory.create("test_heap_attach_0", 64).unwrap();
    assert_eq!(unsafe { buf2.as_ptr().read() }, 0xAB);
    assert_eq!(buf1.as_ptr(), buf2.as_ptr());

    // a larger re-attach is refused
    assert!(factory.create("test_heap_attach_0", 1024).is_err());

    HeapFactory::unlink("test_heap_attach");
    let buf3 = factory.create("test_heap_attach_0", 64).unwrap();
    assert_eq!(unsafe { buf3.as_ptr().read() }, 0);
}
