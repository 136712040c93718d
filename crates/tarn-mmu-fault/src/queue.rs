//! Fault ring buffer consumption.
//!
//! The hardware produces entries at the put pointer; software consumes at the
//! get pointer and publishes it back so the hardware can reuse slots. Get
//! pointer publication is ordered with a barrier before the next slot read so
//! a slot reused by a concurrently-landing fault is never reprocessed.

use tarn_engines::EngineRegistry;

use crate::decode;
use crate::fault::FaultRecord;
use crate::hal::{Channels, FaultHw, QueueId, Timeout};
use crate::regs::{
    self, FaultStatus, FAULT_BUFFER_GET_GETPTR_CORRUPTED_CLEAR, FAULT_BUFFER_GET_OVERFLOW_CLEAR,
    FAULT_BUFFER_GET_PTR_MASK, FAULT_BUFFER_SIZE_ENABLE, FAULT_BUFFER_SIZE_OVERFLOW_INTR_EN,
    FAULT_BUFFER_SIZE_VAL_MASK, FAULT_ENTRY_WORDS,
};
use crate::retry::RetryPolicy;

/// Software-side state of one fault ring. The hardware registers hold the
/// authoritative pointers; this mirrors the get index so a corrupted hardware
/// pointer can be rebuilt.
#[derive(Debug)]
pub struct FaultQueueState {
    queue: QueueId,
    get_index: u32,
    last_fault_address_seen: u64,
}

impl FaultQueueState {
    pub fn new(queue: QueueId) -> Self {
        Self {
            queue,
            get_index: 0,
            last_fault_address_seen: 0,
        }
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn is_empty(&self, hw: &mut dyn FaultHw) -> bool {
        let get = hw.read_fault_buffer_get(self.queue) & FAULT_BUFFER_GET_PTR_MASK;
        let put = hw.read_fault_buffer_put(self.queue) & FAULT_BUFFER_GET_PTR_MASK;
        get == put
    }

    pub fn is_full(&self, hw: &mut dyn FaultHw) -> bool {
        let get = hw.read_fault_buffer_get(self.queue) & FAULT_BUFFER_GET_PTR_MASK;
        let put = hw.read_fault_buffer_put(self.queue) & FAULT_BUFFER_GET_PTR_MASK;
        let capacity = hw.fault_buffer_capacity(self.queue);
        get == (put + 1) % capacity
    }

    /// Writes the ring's address/size registers and republishes the software
    /// get index. Used at bring-up and by overflow recovery.
    pub fn configure(&mut self, hw: &mut dyn FaultHw) {
        let base = hw.fault_buffer_base(self.queue);
        hw.write_fault_buffer_addr(self.queue, base as u32, (base >> 32) as u32);
        let capacity = hw.fault_buffer_capacity(self.queue);
        hw.write_fault_buffer_size(
            self.queue,
            (capacity & FAULT_BUFFER_SIZE_VAL_MASK)
                | FAULT_BUFFER_SIZE_OVERFLOW_INTR_EN
                | FAULT_BUFFER_SIZE_ENABLE,
        );
        hw.write_fault_buffer_get(self.queue, self.get_index);
    }

    pub fn is_enabled(&self, hw: &mut dyn FaultHw) -> bool {
        hw.read_fault_buffer_size(self.queue) & FAULT_BUFFER_SIZE_ENABLE != 0
    }

    pub fn enable(&mut self, hw: &mut dyn FaultHw) {
        let size = hw.read_fault_buffer_size(self.queue);
        hw.write_fault_buffer_size(self.queue, size | FAULT_BUFFER_SIZE_ENABLE);
    }

    /// Disables delivery and waits for the unit to quiesce, so the ring
    /// backing store can be unmapped. Callers hold the fault-disable lock.
    pub fn disable(&mut self, hw: &mut dyn FaultHw, retry: &RetryPolicy) -> Result<(), Timeout> {
        let size = hw.read_fault_buffer_size(self.queue);
        hw.write_fault_buffer_size(self.queue, size & !FAULT_BUFFER_SIZE_ENABLE);
        retry.poll(hw, |hw| !hw.read_fault_status().contains(FaultStatus::BUSY))
    }

    /// Overflow / get-pointer-corruption recovery. Rewrites the ring
    /// registers before any entry is consumed and clears each detected
    /// condition's acknowledgement bit exactly once.
    pub fn handle_overflow(&mut self, hw: &mut dyn FaultHw, status: FaultStatus) {
        let corrupted = status.contains(self.getptr_corrupted_bit());
        tracing::warn!(
            queue = ?self.queue,
            getptr_corrupted = corrupted,
            "fault buffer overflow"
        );

        if corrupted {
            // The hardware get pointer is garbage. Resynchronize to put:
            // everything in the ring is stale and will be re-reported.
            self.get_index = hw.read_fault_buffer_put(self.queue) & FAULT_BUFFER_GET_PTR_MASK;
        }

        self.configure(hw);

        let mut get = self.get_index | FAULT_BUFFER_GET_OVERFLOW_CLEAR;
        if corrupted {
            get |= FAULT_BUFFER_GET_GETPTR_CORRUPTED_CLEAR;
        }
        hw.write_fault_buffer_get(self.queue, get);

        let ack = status.intersection(self.getptr_corrupted_bit() | self.overflow_bit());
        hw.write_fault_status(ack);
    }

    /// Drains every valid entry, at most one full lap. The replayable queue
    /// suppresses consecutive duplicates of the same non-zero address; the
    /// duplicate's channel reference is released by the record drop.
    pub fn drain<'a>(
        &mut self,
        hw: &mut dyn FaultHw,
        registry: &EngineRegistry,
        channels: &'a dyn Channels,
    ) -> Vec<FaultRecord<'a>> {
        let capacity = hw.fault_buffer_capacity(self.queue);
        let mut records = Vec::new();
        self.last_fault_address_seen = 0;

        for _ in 0..capacity {
            let mut words = [0u32; FAULT_ENTRY_WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                *word = hw.read_entry_word(self.queue, self.get_index, i);
            }
            if !regs::entry_valid(&words) {
                break;
            }
            // Clear the slot's valid flag so a stale lap never re-reads it.
            hw.write_entry_word(
                self.queue,
                self.get_index,
                FAULT_ENTRY_WORDS - 1,
                regs::entry_clear_valid(words[FAULT_ENTRY_WORDS - 1]),
            );

            let record = decode::decode_ring_entry(&words, registry, channels);

            self.get_index = (self.get_index + 1) % capacity;
            hw.write_fault_buffer_get(self.queue, self.get_index);
            hw.barrier();

            if self.queue == QueueId::Replayable
                && record.fault_addr != 0
                && record.fault_addr == self.last_fault_address_seen
            {
                tracing::debug!(
                    fault_addr = format_args!("{:#x}", record.fault_addr),
                    "duplicate replayable fault dropped"
                );
                continue;
            }
            self.last_fault_address_seen = record.fault_addr;
            records.push(record);
        }
        records
    }

    fn overflow_bit(&self) -> FaultStatus {
        match self.queue {
            QueueId::Replayable => FaultStatus::REPLAYABLE_OVERFLOW,
            QueueId::NonReplayable => FaultStatus::NON_REPLAYABLE_OVERFLOW,
        }
    }

    fn getptr_corrupted_bit(&self) -> FaultStatus {
        match self.queue {
            QueueId::Replayable => FaultStatus::REPLAYABLE_GETPTR_CORRUPTED,
            QueueId::NonReplayable => FaultStatus::NON_REPLAYABLE_GETPTR_CORRUPTED,
        }
    }
}
