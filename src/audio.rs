//! Audio container sniffing, payload validation and the bundled fallback tone.
//!
//! The fallback chime is what rings when no generated audio is available;
//! it is synthesized once at startup so it never depends on disk or network.

use std::f32::consts::PI;
use std::io::Cursor;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CHIME_SAMPLE_RATE: u32 = 22050;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
    M4a,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::M4a => "m4a",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Flac => "audio/flac",
            Self::M4a => "audio/mp4",
        }
    }

    /// Map a declared content type or format name ("audio/mpeg", "mp3").
    pub fn from_declared(declared: &str) -> Option<Self> {
        let declared = declared.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match declared.as_str() {
            "wav" | "wave" | "audio/wav" | "audio/wave" | "audio/x-wav" => Some(Self::Wav),
            "mp3" | "mpeg" | "audio/mpeg" | "audio/mp3" => Some(Self::Mp3),
            "ogg" | "opus" | "audio/ogg" | "audio/opus" => Some(Self::Ogg),
            "flac" | "audio/flac" | "audio/x-flac" => Some(Self::Flac),
            "m4a" | "aac" | "audio/mp4" | "audio/aac" | "audio/x-m4a" => Some(Self::M4a),
            _ => None,
        }
    }

    /// Detect the container from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Some(Self::Wav);
        }
        if bytes.len() >= 4 && &bytes[0..4] == b"OggS" {
            return Some(Self::Ogg);
        }
        if bytes.len() >= 4 && &bytes[0..4] == b"fLaC" {
            return Some(Self::Flac);
        }
        if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
            return Some(Self::M4a);
        }
        if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
            return Some(Self::Mp3);
        }
        // Bare MPEG audio frame sync: 11 set bits.
        if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
            return Some(Self::Mp3);
        }
        None
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioValidationError {
    #[error("audio payload is empty")]
    Empty,

    #[error("audio payload too small: {size} bytes (minimum {min})")]
    TooSmall { size: usize, min: usize },

    #[error("unrecognized audio container")]
    UnknownContainer,

    #[error("declared format {declared} does not match detected {detected}")]
    FormatMismatch {
        declared: AudioFormat,
        detected: AudioFormat,
    },

    #[error("corrupt WAV payload: {0}")]
    CorruptWav(String),
}

/// Accept a synthesized payload only if it is non-empty, large enough and
/// carries a recognizable container signature.
pub fn validate_audio(
    bytes: &[u8],
    declared: Option<AudioFormat>,
    min_bytes: usize,
) -> Result<AudioFormat, AudioValidationError> {
    if bytes.is_empty() {
        return Err(AudioValidationError::Empty);
    }
    if bytes.len() < min_bytes {
        return Err(AudioValidationError::TooSmall {
            size: bytes.len(),
            min: min_bytes,
        });
    }

    let detected = AudioFormat::sniff(bytes).ok_or(AudioValidationError::UnknownContainer)?;
    if let Some(declared) = declared {
        if declared != detected {
            return Err(AudioValidationError::FormatMismatch { declared, detected });
        }
    }

    if detected == AudioFormat::Wav {
        let reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| AudioValidationError::CorruptWav(e.to_string()))?;
        if reader.duration() == 0 {
            return Err(AudioValidationError::CorruptWav("no samples".into()));
        }
    }

    Ok(detected)
}

/// Encode mono f32 samples in [-1, 1] as a 16-bit PCM WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Bytes, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(samples.len() * 2 + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            // f32 [-1, 1] → i16
            let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(Bytes::from(cursor.into_inner()))
}

/// Three rising notes, repeated twice, with a short fade on every note.
pub fn fallback_chime() -> Result<Bytes, hound::Error> {
    const NOTES: [f32; 3] = [659.25, 783.99, 1046.5]; // E5 G5 C6
    const NOTE_SECS: f32 = 0.28;
    const GAP_SECS: f32 = 0.07;
    const REPEATS: usize = 2;

    let rate = CHIME_SAMPLE_RATE as f32;
    let note_len = (NOTE_SECS * rate) as usize;
    let gap_len = (GAP_SECS * rate) as usize;
    let fade = note_len / 10;

    let mut samples = Vec::with_capacity(REPEATS * NOTES.len() * (note_len + gap_len));
    for _ in 0..REPEATS {
        for freq in NOTES {
            for i in 0..note_len {
                let t = i as f32 / rate;
                let envelope = if i < fade {
                    i as f32 / fade as f32
                } else if i > note_len - fade {
                    (note_len - i) as f32 / fade as f32
                } else {
                    1.0
                };
                samples.push(0.6 * envelope * (2.0 * PI * freq * t).sin());
            }
            samples.extend(std::iter::repeat(0.0).take(gap_len));
        }
    }

    encode_wav(&samples, CHIME_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_containers() {
        assert_eq!(AudioFormat::sniff(b"RIFF\0\0\0\0WAVEfmt "), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::sniff(b"ID3\x04\0\0"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::sniff(&[0xFF, 0xFB, 0x90, 0x00]), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::sniff(b"OggS\0\x02"), Some(AudioFormat::Ogg));
        assert_eq!(AudioFormat::sniff(b"fLaC\0\0\0\x22"), Some(AudioFormat::Flac));
        assert_eq!(AudioFormat::sniff(b"\0\0\0\x20ftypM4A "), Some(AudioFormat::M4a));
        assert_eq!(AudioFormat::sniff(b"<html>"), None);
    }

    #[test]
    fn fallback_chime_is_valid_wav() {
        let chime = fallback_chime().unwrap();
        assert_eq!(validate_audio(&chime, None, 1024), Ok(AudioFormat::Wav));
    }

    #[test]
    fn rejects_empty_small_and_unknown_payloads() {
        assert_eq!(validate_audio(b"", None, 16), Err(AudioValidationError::Empty));
        assert!(matches!(
            validate_audio(b"ID3abc", None, 16),
            Err(AudioValidationError::TooSmall { size: 6, min: 16 })
        ));
        assert_eq!(
            validate_audio(&[0u8; 64], None, 16),
            Err(AudioValidationError::UnknownContainer)
        );
    }

    #[test]
    fn rejects_declared_format_mismatch() {
        let chime = fallback_chime().unwrap();
        assert!(matches!(
            validate_audio(&chime, Some(AudioFormat::Mp3), 16),
            Err(AudioValidationError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn rejects_truncated_wav_header() {
        let mut bytes = b"RIFF\x24\0\0\0WAVE".to_vec();
        bytes.extend_from_slice(&[0u8; 40]);
        assert!(matches!(
            validate_audio(&bytes, None, 16),
            Err(AudioValidationError::CorruptWav(_))
        ));
    }

    #[test]
    fn declared_formats_are_normalized() {
        assert_eq!(AudioFormat::from_declared("audio/mpeg"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::from_declared("audio/wav; codecs=1"), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::from_declared("text/plain"), None);
    }
}
