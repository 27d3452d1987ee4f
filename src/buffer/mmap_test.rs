use super::*;

use std::env;

#[test]
fn test_mmap_buffer() {
    let dir = {
        let mut dir = env::temp_dir();
        dir.push("shmbt-test-mmap-buffer");
        dir
    };
    let factory = MmapFactory::new(&dir).unwrap();
    factory.unlink("test_mmap_buffer").unwrap();

    let buf = factory.create("test_mmap_buffer_0", 4096).unwrap();
    assert_eq!(buf.to_name(), "test_mmap_buffer_0");
    assert_eq!(buf.len(), 4096);

    let bytes = unsafe { std::slice::from_raw_parts_mut(buf.as_ptr(), buf.len()) };
    assert!(bytes.iter().all(|b| *b == 0));
    bytes[0] = 0xCA;
    bytes[4095] = 0xFE;
    buf.flush().unwrap();
    std::mem::drop(buf);

    // re-attach picks up the persisted bytes
    let buf = factory.create("test_mmap_buffer_0", 4096).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
    assert_eq!(bytes[0], 0xCA);
    assert_eq!(bytes[4095], 0xFE);

    factory.unlink("test_mmap_buffer").unwrap();
}

#[test]
fn test_mmap_adopts_larger_file() {
    let dir = {
        let mut dir = env::temp_dir();
        dir.push("shmbt-test-mmap-grow");
        dir
    };
    let factory = MmapFactory::new(&dir).unwrap();
    factory.unlink("test_mmap_grow").unwrap();

    let buf = factory.create("test_mmap_grow_0", 8192).unwrap();
    assert_eq!(buf.len(), 8192);
    std::mem::drop(buf);

    // a smaller request against an existing file adopts the file size
    let buf = factory.create("test_mmap_grow_0", 1024).unwrap();
    assert_eq!(buf.len(), 8192);

    factory.unlink("test_mmap_grow").unwrap();
}
