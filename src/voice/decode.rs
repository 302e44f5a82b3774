//! Fragment decoding
//!
//! Turns container bytes into mono f32 samples. WAV goes through hound, MP3
//! through minimp3, raw L16 PCM is read directly when the MIME hint says so,
//! and everything else (Ogg/Vorbis, FLAC) is probed by symphonia.

use std::io::Cursor;

use crate::voice::sequencer::{AudioFragment, DecodedAudio};
use crate::{Error, Result};

/// Sample rate assumed for raw PCM without a `rate=` parameter
const DEFAULT_PCM_RATE: u32 = 24000;

/// Decode a fragment to mono samples at its native rate
///
/// # Errors
///
/// Returns `FragmentDecodeFailed` if the bytes cannot be decoded
pub fn decode_fragment(fragment: &AudioFragment) -> Result<DecodedAudio> {
    let data = fragment.data();
    if data.is_empty() {
        return Err(Error::FragmentDecodeFailed("empty fragment".to_string()));
    }

    if let Some(rate) = fragment.mime_type().and_then(raw_pcm_rate) {
        return Ok(decode_pcm16(data, rate));
    }

    if data.starts_with(b"RIFF") {
        return decode_wav(data);
    }

    if data.starts_with(b"ID3") || is_mp3_sync(data) {
        return decode_mp3(data);
    }

    decode_symphonia(data)
}

/// Sample rate for raw 16-bit PCM MIME types (`audio/pcm`, `audio/L16`)
///
/// Returns `None` for any other MIME type.
fn raw_pcm_rate(mime: &str) -> Option<u32> {
    let mut params = mime.split(';').map(str::trim);
    let essence = params.next()?.to_ascii_lowercase();
    if essence != "audio/pcm" && essence != "audio/l16" {
        return None;
    }

    let rate = params
        .filter_map(|p| p.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(DEFAULT_PCM_RATE);
    Some(rate)
}

fn is_mp3_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xE0) == 0xE0
}

/// Little-endian signed 16-bit mono PCM
fn decode_pcm16(data: &[u8], sample_rate: u32) -> DecodedAudio {
    let samples = data
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();
    DecodedAudio {
        samples,
        sample_rate,
    }
}

fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::FragmentDecodeFailed(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::FragmentDecodeFailed(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::FragmentDecodeFailed(format!("WAV decode error: {e}")))?
        }
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

#[allow(clippy::cast_sign_loss)]
fn decode_mp3(data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut samples = Vec::new();
    let mut sample_rate = 0_u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                let interleaved: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&interleaved, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => {
                return Err(Error::FragmentDecodeFailed(format!("MP3 decode error: {e}")));
            }
        }
    }

    if sample_rate == 0 {
        return Err(Error::FragmentDecodeFailed("MP3 contained no frames".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Probe and decode any container symphonia knows about
fn decode_symphonia(data: &[u8]) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let fail = |what: &str, e: &dyn std::fmt::Display| {
        Error::FragmentDecodeFailed(format!("{what}: {e}"))
    };

    let cursor = Cursor::new(data.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| fail("unrecognized audio format", &e))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::FragmentDecodeFailed("no audio track found".to_string()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::FragmentDecodeFailed("no sample rate".to_string()))?;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| fail("unsupported codec", &e))?;

    let track_id = track.id;
    let mut interleaved: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(fail("failed to read packet", &e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder
            .decode(&packet)
            .map_err(|e| fail("failed to decode packet", &e))?;

        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(sample_buf.samples());
    }

    Ok(DecodedAudio {
        samples: downmix(&interleaved, channels),
        sample_rate,
    })
}

/// Average interleaved frames down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio using rubato
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::new();

    for chunk in input.chunks(chunk_size) {
        let wave: [&[f64]; 1] = [chunk];
        let result = if chunk.len() == chunk_size {
            resampler.process(&wave[..], None)
        } else {
            resampler.process_partial(Some(&wave[..]), None)
        }
        .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output.iter().map(|&s| s as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::samples_to_wav;

    #[test]
    fn test_raw_pcm_rate() {
        assert_eq!(raw_pcm_rate("audio/L16;codec=pcm;rate=24000"), Some(24000));
        assert_eq!(raw_pcm_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(raw_pcm_rate("audio/pcm"), Some(DEFAULT_PCM_RATE));
        assert_eq!(raw_pcm_rate("audio/ogg"), None);
    }

    #[test]
    fn test_decode_pcm_fragment() {
        let bytes: Vec<u8> = [0_i16, 16384, -16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let fragment = AudioFragment::new(bytes, Some("audio/pcm;rate=8000".to_string()));

        let audio = decode_fragment(&fragment).unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.samples, vec![0.0, 0.5, -0.5]);
    }

    #[test]
    fn test_decode_wav_fragment() {
        let samples = vec![0.0, 0.25, -0.25, 0.5];
        let wav = samples_to_wav(&samples, 16000).unwrap();
        let fragment = AudioFragment::new(wav, None);

        let audio = decode_fragment(&fragment).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.samples.len(), samples.len());
        assert!((audio.samples[1] - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_garbage_is_decode_failure() {
        let fragment = AudioFragment::new(b"definitely not audio".to_vec(), None);
        assert!(matches!(
            decode_fragment(&fragment),
            Err(Error::FragmentDecodeFailed(_))
        ));
    }

    #[test]
    fn test_empty_is_decode_failure() {
        let fragment = AudioFragment::new(Vec::new(), None);
        assert!(matches!(
            decode_fragment(&fragment),
            Err(Error::FragmentDecodeFailed(_))
        ));
    }

    #[test]
    fn test_downmix_stereo() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 24000, 24000).unwrap(), samples);
    }

    #[test]
    fn test_resample_changes_length() {
        let samples = vec![0.0; 16000];
        let out = resample(&samples, 16000, 24000).unwrap();
        // Roughly 1.5x, allowing for resampler delay and padding
        assert!(out.len() > 20000 && out.len() < 28000, "got {}", out.len());
    }
}
