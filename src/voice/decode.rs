//! Compressed audio decoding for playback

use std::io::Cursor;

use crate::{Error, Result};

/// Decodes encoded audio into mono f32 samples at a target rate
pub trait AudioDecoder: Send + Sync {
    /// Decode a whole payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is corrupt or decodes to nothing
    fn decode(&self, bytes: &[u8], target_rate: u32) -> Result<Vec<f32>>;
}

/// MP3 decoder backed by minimp3
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp3Decoder;

impl AudioDecoder for Mp3Decoder {
    #[allow(clippy::cast_sign_loss)]
    fn decode(&self, bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
        let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
        let mut samples = Vec::new();
        let mut sample_rate = target_rate;

        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    sample_rate = frame.sample_rate as u32;
                    if frame.channels == 2 {
                        samples.extend(frame.data.chunks(2).map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            f32::midpoint(left, right)
                        }));
                    } else {
                        samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                    }
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }

        if samples.is_empty() {
            return Err(Error::Audio("no audio frames decoded".to_string()));
        }

        if sample_rate == target_rate {
            Ok(samples)
        } else {
            resample(&samples, sample_rate, target_rate)
        }
    }
}

/// Resample mono audio using rubato
///
/// The final partial chunk is zero-padded and the output trimmed to the
/// expected length so the tail of the utterance is kept.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    const CHUNK_SIZE: usize = 1024;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + CHUNK_SIZE);
    for chunk in samples.chunks(CHUNK_SIZE) {
        let mut input: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        input.resize(CHUNK_SIZE, 0.0);

        let result = resampler
            .process(&[input], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    // Flush the filter delay
    while output.len() < expected + delay {
        let result = resampler
            .process(&[vec![0.0; CHUNK_SIZE]], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output
        .iter()
        .skip(delay)
        .take(expected)
        .map(|&s| s as f32)
        .collect())
}
