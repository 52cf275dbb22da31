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

//! Event queue creation and destruction.
//!
//! ```text
//!  create:  ring ─> EQ to hw ─> map port events
//!  undo:    free    EQ to sw    unmap
//! ```

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::admin::AdminCommand;
use crate::config::UNMAP_EVENTS;
use crate::entry::{EventEntry, EventType};
use crate::eq::EventQueue;
use crate::error::{QueueError, Result};
use crate::lifecycle::{ContextEnv, Rollback, Teardown, Undo, allocate_ring, doorbell_at, hand_back};
use crate::platform::Platform;

/// Events routed to the queue.
const EVENT_MASK: u64 = 1 << EventType::PORT_STATE_CHANGE;

/// Create event queue `number` with `capacity` entries and route port state
/// changes to it.
#[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
pub fn create_event_queue<P: Platform>(
    env: &mut ContextEnv<'_, P>,
    capacity: u32,
    number: u32,
) -> Result<EventQueue> {
    let platform = env.platform;
    let ops = env.profile.opcodes;
    if !capacity.is_power_of_two() {
        return Err(QueueError::InvalidState);
    }

    let mut rb = Rollback::new(env);
    let ring = allocate_ring(platform, capacity, EventEntry::SIZE)?;
    rb.push(Undo::Dma(ring));
    let mut eq = EventQueue::new(ring, capacity, number).ok_or(QueueError::InvalidState)?;
    eq.initialize(platform)?;

    let resp = rb.env().command(
        AdminCommand::new(ops.sw2hw_eq)
            .with_input_modifier(number)
            .with_param64(0, ring.device_addr(platform))
            .with_param(2, capacity.trailing_zeros()),
    )?;
    rb.push(Undo::Command {
        opcode: ops.hw2sw_eq,
        input_modifier: number,
    });
    eq.bind(doorbell_at(resp.word(0)));

    rb.env().command(
        AdminCommand::new(ops.map_eq)
            .with_input_modifier(number)
            .with_param64(0, EVENT_MASK),
    )?;

    rb.commit();
    log::info!("event queue {:#x} ready: {} entries", number, capacity);
    Ok(eq)
}

/// Unroute events from `eq` and hand it back. The ring is freed only once
/// the device has given it up; the first failure is returned.
#[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
pub fn destroy_event_queue<P: Platform>(
    env: &mut ContextEnv<'_, P>,
    eq: EventQueue,
    teardown: Teardown,
) -> Result<()> {
    let ops = env.profile.opcodes;
    let number = eq.number();

    let unmapped = hand_back(env, teardown, ops.map_eq, UNMAP_EVENTS | number);
    if let Err(e) = &unmapped {
        log::error!("event queue {:#x}: unmap failed: {}", number, e);
    }
    let returned = hand_back(env, teardown, ops.hw2sw_eq, number);
    match &returned {
        Ok(()) => {
            env.platform.free_dma(eq.ring());
            log::info!("event queue {:#x} destroyed", number);
        }
        Err(e) => {
            log::error!(
                "event queue {:#x}: hand-back failed: {}; leaking ring {:#x}",
                number,
                e,
                eq.ring().addr
            );
        }
    }
    unmapped.and(returned)
}
