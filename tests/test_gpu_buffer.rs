//! Tests for the move-only device buffer
//!
//! Ownership is observed through the host backend's allocation ledger.
//! This file covers moves, swaps, collections and thread hand-off, and
//! failure injection for allocation and transfer.

use std::mem;
use std::thread;

use ondevice_trainer::opencl::{Buffer, HostContext, HostMemory, HostQueue};
use ondevice_trainer::NnError;

fn filled(context: &HostContext, queue: &HostQueue, values: &[f32]) -> Buffer<HostMemory> {
    let buffer = Buffer::new(context, values.len() * 4, false, None).unwrap();
    buffer.write_f32(queue, values).unwrap();
    buffer
}

fn contents(queue: &HostQueue, buffer: &Buffer<HostMemory>) -> Vec<f32> {
    let mut out = vec![0.0f32; buffer.size() / 4];
    buffer.read_f32(queue, &mut out).unwrap();
    out
}

// ============================================================================
// Ownership
// ============================================================================

mod ownership_tests {
    use super::*;

    #[test]
    fn test_move_transfers_the_allocation() {
        let context = HostContext::new();
        let queue = HostQueue::new();

        let first = filled(&context, &queue, &[1.0, 2.0, 3.0]);
        let id = first.handle().id();
        let second = first;

        assert_eq!(context.allocated(), 1);
        assert_eq!(context.released(), 0);
        assert_eq!(second.handle().id(), id);
        assert_eq!(contents(&queue, &second), vec![1.0, 2.0, 3.0]);

        drop(second);
        assert_eq!(context.released(), 1);
        assert_eq!(context.live(), 0);
    }

    #[test]
    fn test_move_through_function_boundaries() {
        fn pass_through(buffer: Buffer<HostMemory>) -> Buffer<HostMemory> {
            buffer
        }
        fn consume(buffer: Buffer<HostMemory>) -> usize {
            buffer.size()
        }

        let context = HostContext::new();
        let queue = HostQueue::new();
        let buffer = pass_through(filled(&context, &queue, &[4.0, 5.0]));
        assert_eq!(context.released(), 0);
        assert_eq!(contents(&queue, &buffer), vec![4.0, 5.0]);

        assert_eq!(consume(buffer), 8);
        assert_eq!(context.released(), 1);
    }

    #[test]
    fn test_reassignment_releases_previous_allocation() {
        let context = HostContext::new();
        let queue = HostQueue::new();

        let mut slot = filled(&context, &queue, &[1.0]);
        assert_eq!(contents(&queue, &slot), vec![1.0]);
        slot = filled(&context, &queue, &[2.0]);

        assert_eq!(context.allocated(), 2);
        assert_eq!(context.released(), 1);
        assert_eq!(contents(&queue, &slot), vec![2.0]);
    }

    #[test]
    fn test_swap_and_replace() {
        let context = HostContext::new();
        let queue = HostQueue::new();

        let mut a = filled(&context, &queue, &[1.0, 1.0]);
        let mut b = filled(&context, &queue, &[2.0, 2.0]);
        mem::swap(&mut a, &mut b);
        assert_eq!(context.released(), 0);
        assert_eq!(contents(&queue, &a), vec![2.0, 2.0]);
        assert_eq!(contents(&queue, &b), vec![1.0, 1.0]);

        let old = mem::replace(&mut a, filled(&context, &queue, &[3.0]));
        assert_eq!(context.released(), 0);
        assert_eq!(contents(&queue, &old), vec![2.0, 2.0]);
        drop(old);
        assert_eq!(context.released(), 1);
        assert_eq!(context.live(), 2);
    }

    #[test]
    fn test_collections_own_their_buffers() {
        let context = HostContext::new();
        let queue = HostQueue::new();

        let mut buffers: Vec<_> = (0..4)
            .map(|i| filled(&context, &queue, &[i as f32]))
            .collect();
        let taken = buffers.remove(2);
        assert_eq!(contents(&queue, &taken), vec![2.0]);

        buffers.clear();
        assert_eq!(context.released(), 3);
        assert_eq!(context.live(), 1);

        let mut holder = Some(taken);
        let moved = holder.take();
        assert!(holder.is_none());
        drop(moved);
        assert_eq!(context.live(), 0);
    }

    #[test]
    fn test_buffer_can_move_to_another_thread() {
        let context = HostContext::new();
        let queue = HostQueue::new();
        let buffer = filled(&context, &queue, &[6.0, 7.0]);

        let values = thread::spawn(move || {
            let queue = HostQueue::new();
            contents(&queue, &buffer)
        })
        .join()
        .unwrap();

        assert_eq!(values, vec![6.0, 7.0]);
        assert_eq!(context.released(), 1);
    }
}

// ============================================================================
// Failures
// ============================================================================

mod failure_tests {
    use super::*;

    #[test]
    fn test_allocation_failure_yields_no_buffer() {
        let context = HostContext::new();
        context.set_fail_allocations(true);
        let result = Buffer::new(&context, 16, false, None);
        assert!(matches!(result, Err(NnError::Device(_))));
        assert_eq!(context.allocated(), 0);

        context.set_fail_allocations(false);
        assert!(Buffer::new(&context, 16, false, None).is_ok());
    }

    #[test]
    fn test_transfer_failure_is_reported() {
        let context = HostContext::new();
        let queue = HostQueue::new();
        let buffer = filled(&context, &queue, &[1.0, 2.0]);

        queue.set_fail_transfers(true);
        assert!(matches!(
            buffer.write_f32(&queue, &[9.0, 9.0]),
            Err(NnError::Device(_))
        ));
        let mut out = [0.0f32; 2];
        assert!(matches!(
            buffer.read_f32(&queue, &mut out),
            Err(NnError::Device(_))
        ));
        assert_eq!(out, [0.0, 0.0]);

        queue.set_fail_transfers(false);
        assert_eq!(contents(&queue, &buffer), vec![1.0, 2.0]);
    }

    #[test]
    fn test_size_mismatch_rejected_before_transfer() {
        let context = HostContext::new();
        let queue = HostQueue::new();
        let buffer = filled(&context, &queue, &[1.0, 2.0, 3.0, 4.0]);

        let mut short = [0.0f32; 3];
        assert!(matches!(
            buffer.read_f32(&queue, &mut short),
            Err(NnError::InvalidParameter(_))
        ));
        assert!(matches!(
            buffer.write_data(&queue, &[0u8; 17]),
            Err(NnError::InvalidParameter(_))
        ));
        assert_eq!(contents(&queue, &buffer), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_read_only_flag_is_kept() {
        let context = HostContext::new();
        let bytes = 1.5f32.to_ne_bytes();
        let buffer = Buffer::new(&context, 4, true, Some(&bytes)).unwrap();
        assert!(buffer.is_read_only());
        assert_eq!(buffer.size(), 4);
        assert_eq!(buffer.handle().len(), 4);
    }
}
