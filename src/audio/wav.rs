//! In-memory WAV framing for flush payloads
//!
//! The capture device emits headerless PCM16 fragments; each flush payload
//! is framed as a proper WAV before it goes to the gateway. The data chunk
//! is exactly the concatenated fragment bytes.

use std::io::Cursor;

use hound::{WavSpec, WavWriter};

/// Wrap raw little-endian PCM16 mono bytes in a WAV container.
/// A trailing odd byte (never produced by the capture path) is dropped.
pub fn encode_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for sample in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
