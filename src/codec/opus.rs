//! Opus wrapper for the dynamic audio payload type negotiated in SDP.
//!
//! Gated behind the `opus` feature; callers that never negotiate Opus never
//! need to pull in `audiopus`/`libopus`.

use crate::error::CodecError;

#[cfg(feature = "opus")]
mod backend {
    use super::CodecError;
    use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
    use audiopus::{Application, Channels, SampleRate};

    pub struct OpusCodec {
        encoder: OpusEncoder,
        decoder: OpusDecoder,
        frame_samples: usize,
    }

    impl OpusCodec {
        pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
            let rate = match sample_rate {
                8000 => SampleRate::Hz8000,
                12000 => SampleRate::Hz12000,
                16000 => SampleRate::Hz16000,
                24000 => SampleRate::Hz24000,
                48000 => SampleRate::Hz48000,
                other => return Err(CodecError::Opus(format!("unsupported opus rate {other}"))),
            };
            let encoder = OpusEncoder::new(rate, Channels::Mono, Application::Voip)
                .map_err(|e| CodecError::Opus(e.to_string()))?;
            let decoder =
                OpusDecoder::new(rate, Channels::Mono).map_err(|e| CodecError::Opus(e.to_string()))?;
            let frame_samples = (sample_rate as usize) / 50; // 20ms frame
            Ok(Self { encoder, decoder, frame_samples })
        }

        pub fn frame_samples(&self) -> usize {
            self.frame_samples
        }

        pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
            let mut out = vec![0u8; 4000];
            let written = self
                .encoder
                .encode(pcm, &mut out)
                .map_err(|e| CodecError::Opus(e.to_string()))?;
            out.truncate(written);
            Ok(out)
        }

        pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
            let mut out = vec![0i16; self.frame_samples];
            let written = self
                .decoder
                .decode(Some(payload), &mut out, false)
                .map_err(|e| CodecError::Opus(e.to_string()))?;
            out.truncate(written);
            Ok(out)
        }
    }
}

#[cfg(feature = "opus")]
pub use backend::OpusCodec;

#[cfg(not(feature = "opus"))]
pub struct OpusCodec;

#[cfg(not(feature = "opus"))]
impl OpusCodec {
    pub fn new(_sample_rate: u32) -> Result<Self, CodecError> {
        Err(CodecError::FeatureDisabled("opus"))
    }

    pub fn frame_samples(&self) -> usize {
        0
    }

    pub fn encode(&mut self, _pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::FeatureDisabled("opus"))
    }

    pub fn decode(&mut self, _payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        Err(CodecError::FeatureDisabled("opus"))
    }
}
