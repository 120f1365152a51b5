//! The engine's foreign memory layouts.
//!
//! The engine manages its own garbage-collected heap. Strings cross the
//! boundary as UTF-16 with the byte length stored in the four bytes
//! preceding the data, byte buffers as a backing buffer plus a 12-byte
//! array header `{buffer, data_start, byte_length}`. All integers are
//! little-endian 32-bit. These helpers only compute and interpret layouts
//! over a plain byte slice; allocation and pinning happen in the adapter.

use crate::{Error, Result};

/// Runtime class id of the engine's `ArrayBuffer`.
pub(crate) const ARRAY_BUFFER_CLASS_ID: i32 = 1;
/// Runtime class id of the engine's `String`.
pub(crate) const STRING_CLASS_ID: i32 = 2;
/// Runtime class id of the engine's `Uint8Array` view.
pub(crate) const UINT8_ARRAY_CLASS_ID: i32 = 9;

/// Size of the array-view header: buffer pointer, data pointer, byte length.
pub(crate) const ARRAY_HEADER_SIZE: usize = 12;

/// Encode a string into the engine's UTF-16LE data layout.
pub(crate) fn encode_utf16(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len() * 2);
    for unit in value.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Build the 12-byte array-view header pointing at `buffer_ptr`.
pub(crate) fn array_header(buffer_ptr: u32, byte_length: u32) -> [u8; ARRAY_HEADER_SIZE] {
    let mut header = [0u8; ARRAY_HEADER_SIZE];
    header[0..4].copy_from_slice(&buffer_ptr.to_le_bytes());
    header[4..8].copy_from_slice(&buffer_ptr.to_le_bytes());
    header[8..12].copy_from_slice(&byte_length.to_le_bytes());
    header
}

/// Read a little-endian u32 at `addr`.
pub(crate) fn read_u32(memory: &[u8], addr: usize) -> Result<u32> {
    let bytes = memory
        .get(addr..addr + 4)
        .ok_or_else(|| out_of_bounds(addr, 4, memory.len()))?;
    // get() returned exactly 4 bytes.
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

/// Copy `data` into engine memory at `addr`.
pub(crate) fn write_bytes(memory: &mut [u8], addr: usize, data: &[u8]) -> Result<()> {
    let memory_len = memory.len();
    let target = memory
        .get_mut(addr..addr + data.len())
        .ok_or_else(|| out_of_bounds(addr, data.len(), memory_len))?;
    target.copy_from_slice(data);
    Ok(())
}

/// Decode the engine string whose data starts at `ptr`. The byte length
/// lives in the four bytes preceding the data.
pub(crate) fn read_string(memory: &[u8], ptr: usize) -> Result<String> {
    if ptr < 4 {
        return Err(Error::Engine(format!("string pointer {ptr} has no length prefix")));
    }
    let byte_length = read_u32(memory, ptr - 4)? as usize;
    let data = memory
        .get(ptr..ptr + byte_length)
        .ok_or_else(|| out_of_bounds(ptr, byte_length, memory.len()))?;

    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| Error::Engine("engine string is not valid UTF-16".to_owned()))
}

/// Read the bytes of the engine byte array whose header starts at
/// `header_ptr`.
pub(crate) fn read_byte_array(memory: &[u8], header_ptr: usize) -> Result<Vec<u8>> {
    let data_start = read_u32(memory, header_ptr + 4)? as usize;
    let byte_length = read_u32(memory, header_ptr + 8)? as usize;
    let data = memory
        .get(data_start..data_start + byte_length)
        .ok_or_else(|| out_of_bounds(data_start, byte_length, memory.len()))?;
    Ok(data.to_vec())
}

fn out_of_bounds(addr: usize, len: usize, memory_len: usize) -> Error {
    Error::Engine(format!(
        "engine memory access out of bounds: {len} bytes at {addr} (memory is {memory_len} bytes)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_string(at: usize, value: &str) -> Vec<u8> {
        let data = encode_utf16(value);
        let mut memory = vec![0u8; at + data.len() + 64];
        memory[at - 4..at].copy_from_slice(&(data.len() as u32).to_le_bytes());
        memory[at..at + data.len()].copy_from_slice(&data);
        memory
    }

    #[test]
    fn string_round_trips_through_engine_layout() {
        let memory = memory_with_string(64, "fp_server_key-1");
        assert_eq!(read_string(&memory, 64).unwrap(), "fp_server_key-1");
    }

    #[test]
    fn non_ascii_string_round_trips() {
        let memory = memory_with_string(64, "čau svĕte 🚩");
        assert_eq!(read_string(&memory, 64).unwrap(), "čau svĕte 🚩");
    }

    #[test]
    fn byte_array_reads_through_header() {
        let mut memory = vec![0u8; 256];
        let payload = br#"{"key":true}"#;
        memory[100..100 + payload.len()].copy_from_slice(payload);
        let header = array_header(100, payload.len() as u32);
        memory[40..40 + ARRAY_HEADER_SIZE].copy_from_slice(&header);

        assert_eq!(read_byte_array(&memory, 40).unwrap(), payload);
    }

    #[test]
    fn out_of_bounds_reads_are_rejected() {
        let memory = vec![0u8; 16];
        assert!(read_u32(&memory, 20).is_err());
        assert!(read_string(&memory, 2).is_err());

        // Header claims data beyond the end of memory.
        let mut memory = vec![0u8; 64];
        let header = array_header(60, 32);
        memory[0..ARRAY_HEADER_SIZE].copy_from_slice(&header);
        assert!(read_byte_array(&memory, 0).is_err());
    }
}
