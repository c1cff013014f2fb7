//! PCM audio helpers
//!
//! Devices stream raw i16 mono PCM; the STT collaborators want WAV.

use std::io::Cursor;
use std::path::Path;

use crate::{Error, Result};

/// Encode i16 mono PCM samples as an in-memory WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Audio(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Read a mono 16-bit WAV file into PCM samples and its sample rate
///
/// Used by the `segment-wav` diagnostic subcommand.
///
/// # Errors
///
/// Returns error if the file cannot be read or is not 16-bit mono
pub fn wav_to_pcm(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(Error::Audio(format!(
            "expected 16-bit mono WAV, got {} channels at {} bits",
            spec.channels, spec.bits_per_sample
        )));
    }
    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_valid() {
        let samples: Vec<i16> = (0..320).map(|i| (i % 64) * 100).collect();
        let wav = pcm_to_wav(&samples, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > 44);
    }

    #[test]
    fn wav_round_trip_preserves_samples() {
        let samples: Vec<i16> = vec![0, 100, -100, 32_000, -32_000];
        let wav = pcm_to_wav(&samples, 16_000).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        let back: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(back, samples);
    }
}
