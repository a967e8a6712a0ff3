//! Adapter printf relay.
//!
//! The adapter writes a message into the shared printf buffer and rings
//! `PrintfReady` with `(level << 16) | length` in a mailbox. The host logs
//! it, clears the buffer and answers `AdapPrintfDone`.

use log::{info, warn};

use super::region::{CommRegion, PRINTF_BUFFER_SIZE};
use crate::driver::{AdapterNotify, AdapterTransport};
use crate::types::LOG_AAC_HIGH_ERROR;

/// One relayed adapter message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintfMessage {
    pub level: u16,
    pub text: String,
}

pub fn adapter_printf(comm: &CommRegion, transport: &dyn AdapterTransport, value: u32) -> PrintfMessage {
    let level = (value >> 16) as u16;
    let length = ((value & 0xffff) as usize).min(PRINTF_BUFFER_SIZE - 1);

    let buffer = comm.printf_buffer();
    let mut raw = [0u8; PRINTF_BUFFER_SIZE];
    unsafe {
        core::ptr::copy_nonoverlapping(buffer, raw.as_mut_ptr(), length);
        core::ptr::write_bytes(buffer, 0, PRINTF_BUFFER_SIZE);
    }
    let end = raw[..length].iter().position(|&b| b == 0).unwrap_or(length);
    let text = String::from_utf8_lossy(&raw[..end]).trim_end().to_string();

    if level >= LOG_AAC_HIGH_ERROR {
        warn!("[aacraid] {}: {}", transport.name(), text);
    } else {
        info!("[aacraid] {}: {}", transport.name(), text);
    }
    transport.notify(AdapterNotify::AdapPrintfDone);

    PrintfMessage { level, text }
}
