/*
 * Copyright 2024 Fluence Labs Limited
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use test_log::test;

use super::*;

#[test]
fn creates_lock_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("libpqos");

    let lock = ApiLock::new(&path, 0u32).unwrap();
    {
        let mut guard = lock.lock().unwrap();
        *guard += 1;
    }

    assert!(path.exists());
    assert_eq!(*lock.lock().unwrap(), 1);
}

#[test]
fn missing_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent").join("libpqos");

    let error = ApiLock::new(&path, ()).err().unwrap();

    assert_eq!(error.status(), crate::Status::Error);
}

#[test]
fn serializes_threads() {
    let dir = tempfile::tempdir().unwrap();
    let lock = Arc::new(ApiLock::new(&dir.path().join("libpqos"), Vec::new()).unwrap());

    let handles = (0..4)
        .map(|thread| {
            let lock = lock.clone();
            std::thread::spawn(move || {
                for step in 0..100 {
                    let mut guard = lock.lock().unwrap();
                    guard.push((thread, step));
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(lock.lock().unwrap().len(), 400);
}
