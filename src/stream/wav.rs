use bytes::{BufMut, Bytes, BytesMut};

use super::AudioFormat;
use crate::protocol_constants::WAV_STREAM_SIZE_MAX;

/// Generates a standard 44-byte WAVE header for an infinite LPCM stream.
///
/// Invalid `bits_per_sample` values (anything but 16 or 24) default to 16.
pub fn create_wav_header(audio_format: &AudioFormat) -> Bytes {
    let sample_rate = audio_format.sample_rate;
    let channels = audio_format.channels;

    // Validate bits_per_sample - only 16 and 24 are valid for PCM WAV
    let bits_per_sample = match audio_format.bits_per_sample {
        16 | 24 => audio_format.bits_per_sample,
        other => {
            log::warn!("[WAV] Invalid bits_per_sample {}, defaulting to 16", other);
            16
        }
    };

    let mut header = BytesMut::with_capacity(44);

    // Safe division - bits_per_sample is now guaranteed to be 16 or 24
    let bytes_per_sample = bits_per_sample / 8;
    let byte_rate = sample_rate * channels as u32 * bytes_per_sample as u32;
    let block_align = channels * bytes_per_sample;

    // RIFF header
    header.put_slice(b"RIFF");
    header.put_u32_le(WAV_STREAM_SIZE_MAX); // File size (infinite stream)
    header.put_slice(b"WAVE");

    // fmt chunk
    header.put_slice(b"fmt ");
    header.put_u32_le(16); // Chunk size
    header.put_u16_le(1); // Audio format (PCM)
    header.put_u16_le(channels);
    header.put_u32_le(sample_rate);
    header.put_u32_le(byte_rate);
    header.put_u16_le(block_align);
    header.put_u16_le(bits_per_sample);

    // data chunk
    header.put_slice(b"data");
    header.put_u32_le(WAV_STREAM_SIZE_MAX); // Data size (infinite stream)

    header.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_standard_44_byte_length() {
        let header = create_wav_header(&AudioFormat::new(48000, 2, 16));
        assert_eq!(header.len(), 44);
    }

    #[test]
    fn header_encodes_format_fields() {
        let header = create_wav_header(&AudioFormat::new(44100, 1, 24));

        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(u16::from_le_bytes([header[22], header[23]]), 1); // channels
        assert_eq!(
            u32::from_le_bytes([header[24], header[25], header[26], header[27]]),
            44100
        );
        assert_eq!(u16::from_le_bytes([header[34], header[35]]), 24); // bits_per_sample
    }

    #[test]
    fn invalid_bits_per_sample_defaults_to_16() {
        let header = create_wav_header(&AudioFormat::new(48000, 2, 32));
        assert_eq!(u16::from_le_bytes([header[34], header[35]]), 16);
    }
}
