use rand::prelude::random;

use std::{sync::Arc, thread, time};

use super::*;

#[test]
fn test_spinlock() {
    for &spin in [true, false].iter() {
        run_spinlock(spin);
    }
}

fn run_spinlock(spin: bool) {
    let n_readers = 4;
    let n_writers = 4;
    let size = 1024;

    let lock = Arc::new(Spinlock::new(Data::new(0, size), spin));

    let writer = move |lock: Arc<Spinlock<Data>>, idx: usize| {
        let mut n_ops = 0;
        let value: Vec<u8> = ((idx * size)..((idx * size) + size)).map(|x| x as u8).collect();
        let start = time::SystemTime::now();
        while start.elapsed().unwrap().as_millis() < 1000 {
            let mut data = lock.write();
            data.idx = idx;
            data.value.copy_from_slice(&value);
            n_ops += 1;
        }
        n_ops
    };

    let reader = move |lock: Arc<Spinlock<Data>>| {
        let mut n_ops = 0;
        let mut values = vec![];
        (0..n_writers).for_each(|idx| {
            let value: Vec<u8> =
                ((idx * size)..((idx * size) + size)).map(|x| x as u8).collect();
            values.push(value);
        });

        let start = time::SystemTime::now();
        while start.elapsed().unwrap().as_millis() < 1000 {
            {
                let data = lock.read();
                assert_eq!(values[data.idx], data.value);
                busy_loop(25);
            }
            n_ops += 1;
        }
        n_ops
    };

    let mut writers = vec![];
    for idx in 0..n_writers {
        let lck = Arc::clone(&lock);
        writers.push(thread::spawn(move || writer(lck, idx)));
    }

    let mut readers = vec![];
    for _idx in 0..n_readers {
        let lck = Arc::clone(&lock);
        readers.push(thread::spawn(move || reader(lck)));
    }

    for (idx, w) in writers.into_iter().enumerate() {
        let n: usize = w.join().unwrap();
        println!("spin:{} writer {} ops {}", spin, idx, n);
        assert!(n > 0);
    }
    for (idx, r) in readers.into_iter().enumerate() {
        let n: usize = r.join().unwrap();
        println!("spin:{} reader {} ops {}", spin, idx, n);
        assert!(n > 0);
    }
    println!("test_spinlock Spinlock {}", lock.to_stats().unwrap());
}

struct Data {
    idx: usize,
    value: Vec<u8>,
}

impl Data {
    fn new(idx: usize, size: usize) -> Data {
        let value: Vec<u8> = ((idx * size)..((idx * size) + size)).map(|x| x as u8).collect();
        Data { idx, value }
    }
}

fn busy_loop(count: usize) -> u64 {
    let acc: u64 = (0..count).map(|_| random::<u32>() as u64).sum();
    acc
}
