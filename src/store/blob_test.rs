use arbitrary::{Arbitrary, Unstructured};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeMap, sync::Arc, thread};

use super::*;
use crate::buffer::HeapFactory;

fn new_store(name: &str) -> BlobStore {
    HeapFactory::unlink(name);
    let factory: Arc<dyn BufferFactory> = Arc::new(HeapFactory::new());
    BlobStore::create(factory, Config::new(name)).unwrap()
}

#[test]
fn test_store_create() {
    let store = new_store("test_store_create");
    assert_eq!(store.len(), 0);
    assert!(store.is_empty());
    assert_eq!(store.to_name(), "test_store_create");
}

#[test]
fn test_store_insert_get() {
    let store = new_store("test_store_insert");
    let (i1, i2) = {
        let b1 = store.insert(100_u64).unwrap();
        let b2 = store.insert(1337_u64).unwrap();
        (b1.index(), b2.index())
    };
    assert_eq!(store.len(), 2);

    assert_eq!(*store.get::<u64>(i1).unwrap(), 100);
    assert_eq!(*store.get::<u64>(i2).unwrap(), 1337);
    assert!(store.get::<u64>(i2 + 1).is_none());
}

#[test]
fn test_store_mutate() {
    let store = new_store("test_store_mutate");
    let index = {
        let mut blob = store.insert(1_u64).unwrap();
        *blob += 41;
        blob.index()
    };
    assert_eq!(*store.get::<u64>(index).unwrap(), 42);
}

#[test]
fn test_store_remove_and_reuse() {
    let store = new_store("test_store_remove");
    let indexes: Vec<usize> =
        (0..6_u64).map(|i| store.insert(i * 10).unwrap().index()).collect();
    assert_eq!(store.len(), 6);

    store.remove(indexes[1]);
    store.remove(indexes[3]);
    assert_eq!(store.len(), 4);
    assert_eq!(store.free_slot_count(), 2);
    assert!(store.get::<u64>(indexes[1]).is_none());
    assert!(store.get::<u64>(indexes[3]).is_none());

    // removing again changes nothing.
    store.remove(indexes[3]);
    assert_eq!(store.len(), 4);

    // the untouched blobs are intact.
    for &i in [0_usize, 2, 4, 5].iter() {
        assert_eq!(*store.get::<u64>(indexes[i]).unwrap(), i as u64 * 10);
    }

    // new inserts recycle the freed slots before growing the vector.
    let j1 = store.insert(77_u64).unwrap().index();
    let j2 = store.insert(88_u64).unwrap().index();
    assert!(indexes.contains(&j1));
    assert!(indexes.contains(&j2));
    assert_eq!(store.len(), 6);
}

#[test]
fn test_store_tombstoned_reader() {
    let store = new_store("test_store_tombstone");
    let index = store.insert(0xFEED_u64).unwrap().index();

    let reader = store.get::<u64>(index).unwrap();
    store.remove(index);

    // the outstanding handle keeps reading the original payload.
    assert_eq!(*reader, 0xFEED);
    // no new locks on a tombstoned blob.
    assert!(store.get::<u64>(index).is_none());
    assert!(store.get_mut::<u64>(index).is_none());
    assert_eq!(store.len(), 0);

    std::mem::drop(reader);

    // the slot is recycled now that the last lock drained.
    let reused = store.insert(1_u64).unwrap().index();
    assert_eq!(reused, index);
}

#[test]
fn test_store_compare_and_swap() {
    let store = new_store("test_store_cas");
    let a = store.insert(1_u64).unwrap().downgrade();
    let b = store.insert(2_u64).unwrap();
    let (ia, ib) = (a.index(), b.index());

    assert!(a.compare_and_swap(&b));
    std::mem::drop(a);
    std::mem::drop(b);
    // the payloads changed places under stable indexes.
    assert_eq!(*store.get::<u64>(ia).unwrap(), 2);
    assert_eq!(*store.get::<u64>(ib).unwrap(), 1);

    // a stale handle's offset no longer matches.
    let stale = store.get::<u64>(ia).unwrap();
    let other = store.insert(9_u64).unwrap();
    assert!(!store.compare_and_swap(ia, other.offset(), stale.offset()));
}

#[test]
fn test_store_arrays() {
    let store = new_store("test_store_arrays");
    let index = {
        let mut blob = store.insert_zeroed::<u32>(100).unwrap();
        assert_eq!(blob.as_slice().len(), 100);
        assert!(blob.as_slice().iter().all(|x| *x == 0));
        for (i, x) in blob.as_mut_slice().iter_mut().enumerate() {
            *x = i as u32;
        }
        blob.index()
    };

    let blob = store.get::<u32>(index).unwrap();
    assert_eq!(blob.byte_len(), 400);
    assert!(blob.as_slice().iter().enumerate().all(|(i, x)| *x == i as u32));
}

#[test]
fn test_store_iter() {
    let store = new_store("test_store_iter");
    let indexes: Vec<usize> =
        (0..5_u64).map(|i| store.insert(i).unwrap().index()).collect();
    store.remove(indexes[2]);

    let live: Vec<usize> = store.iter().collect();
    assert_eq!(live, vec![indexes[0], indexes[1], indexes[3], indexes[4]]);
}

#[test]
fn test_store_reattach() {
    let name = "test_store_reattach";
    let store = new_store(name);
    let index = store.insert(0xABCD_u64).unwrap().index();
    std::mem::drop(store);

    let factory: Arc<dyn BufferFactory> = Arc::new(HeapFactory::new());
    let store = BlobStore::create(factory, Config::new(name)).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(*store.get::<u64>(index).unwrap(), 0xABCD);
}

#[test]
fn test_store_ops_model() {
    let seed: u64 = random();
    println!("test_store_ops_model seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    #[derive(Arbitrary, Debug)]
    enum Op {
        Insert(u64),
        Remove(u8),
        Get(u8),
    }

    let store = new_store("test_store_ops_model");
    let mut model: BTreeMap<usize, u64> = BTreeMap::new();

    for _i in 0..5_000 {
        let bytes = rng.gen::<[u8; 16]>();
        let mut uns = Unstructured::new(&bytes);
        match uns.arbitrary::<Op>().unwrap() {
            Op::Insert(value) => {
                let index = store.insert(value).unwrap().index();
                // the slot is either brand new or a recycled dead one.
                assert!(model.insert(index, value).is_none());
            }
            Op::Remove(nth) => match model.keys().nth(nth as usize).copied() {
                Some(index) => {
                    store.remove(index);
                    model.remove(&index);
                }
                None => (),
            },
            Op::Get(nth) => match model.iter().nth(nth as usize) {
                Some((index, value)) => {
                    assert_eq!(*store.get::<u64>(*index).unwrap(), *value);
                }
                None => (),
            },
        }
    }

    assert_eq!(store.len(), model.len());
    let live: Vec<usize> = store.iter().collect();
    let expected: Vec<usize> = model.keys().copied().collect();
    assert_eq!(live, expected);
}

#[test]
fn test_store_concurrent() {
    let seed: u64 = random();
    println!("test_store_concurrent seed:{}", seed);

    let store = Arc::new(new_store("test_store_concurrent"));
    let n_threads = 8_u64;
    let n_blobs = 200_u64;

    let mut handles = vec![];
    for t in 0..n_threads {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed + t);
            let mut live = vec![];
            for i in 0..n_blobs {
                let value = (t << 32) | i;
                live.push((store.insert(value).unwrap().index(), value));
                // remove a random earlier blob now and then.
                if rng.gen::<u8>() % 4 == 0 {
                    let victim = rng.gen::<usize>() % live.len();
                    let (index, _) = live.swap_remove(victim);
                    store.remove(index);
                }
            }
            live
        }));
    }

    let mut n_live = 0;
    for handle in handles {
        for (index, value) in handle.join().unwrap() {
            assert_eq!(*store.get::<u64>(index).unwrap(), value);
            n_live += 1;
        }
    }
    assert_eq!(store.len(), n_live);
    assert_eq!(store.iter().count(), n_live);
}
