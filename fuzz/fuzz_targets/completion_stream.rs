/*
Copyright 2026 The hwqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

#![no_main]

use std::collections::HashSet;

use hwqueue::allocator::QueueNumberAllocator;
use hwqueue::entry::CompletionEntry;
use hwqueue::lifecycle::{ContextEnv, create_queue_pair};
use hwqueue::testing::{MockDevice, TestBuffer, regs};
use hwqueue::{AdminQueue, DriverConfig, QueueKind, QueuePair, QueueProfile, SqShape};
use libfuzzer_sys::fuzz_target;

const CAPACITY: u32 = 8;

fn queue_pair(dev: &MockDevice, profile: &QueueProfile, kind: QueueKind) -> QueuePair<TestBuffer> {
    dev.install_phase_ring_firmware(profile.opcodes);
    let mut config = DriverConfig::default();
    config.set_admin_ring_len(4);
    let mut admin = AdminQueue::phase_ring(dev, &config, regs::phase_ring()).unwrap();
    admin.enable(dev).unwrap();
    let mut allocator = QueueNumberAllocator::new(2, 0);
    let mut env = ContextEnv {
        platform: dev,
        config: &config,
        profile,
        admin: &mut admin,
        allocator: &mut allocator,
        records: None,
    };
    create_queue_pair(&mut env, kind, CAPACITY).unwrap()
}

// Feeds arbitrary device-written completion entries into a queue pair with
// some submissions outstanding. Whatever the device writes, polling must not
// panic and every posted buffer must come back exactly once.
fuzz_target!(|data: (bool, bool, u8, Vec<CompletionEntry>)| {
    let (linked, rx, posts, entries) = data;
    let mut profile = QueueProfile::flat();
    if linked {
        profile.shape = SqShape::Linked;
    }
    let kind = if rx { QueueKind::Rx } else { QueueKind::Tx };

    let dev = MockDevice::new();
    let mut qp = queue_pair(&dev, &profile, kind);
    let posts = u32::from(posts) % (CAPACITY + 1);
    for id in 0..posts {
        qp.post(&dev, TestBuffer::new(id, 64)).unwrap();
    }

    let mut seen = HashSet::new();
    for entry in entries {
        if !dev.push_completion(&qp, entry) {
            break;
        }
        for event in qp.poll(&dev) {
            assert!(event.buffer.id < posts);
            assert!(seen.insert(event.buffer.id), "buffer returned twice");
        }
        assert!(qp.in_flight() <= CAPACITY);
    }
    for event in qp.cancel_all() {
        assert!(seen.insert(event.buffer.id), "cancelled buffer already completed");
    }
    assert_eq!(seen.len() as u32, posts);
});
