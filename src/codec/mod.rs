pub mod g711;
pub mod g729;
pub mod opus;

use crate::error::CodecError;

pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;
pub const PT_G729: u8 = 18;
pub const PT_TELEPHONE_EVENT: u8 = 101;

/// One codec bound to a call: a payload type, a clock rate, and the frame
/// size (in samples) of a 20ms packet.
pub enum Codec {
    Pcmu,
    Pcma,
    Opus(opus::OpusCodec),
    G729(g729::G729Codec),
}

impl Codec {
    pub fn for_payload_type(pt: u8, opus_rate_hint: Option<u32>) -> Result<Self, CodecError> {
        match pt {
            PT_PCMU => Ok(Codec::Pcmu),
            PT_PCMA => Ok(Codec::Pcma),
            PT_G729 => Ok(Codec::G729(g729::G729Codec::new()?)),
            pt if (96..=127).contains(&pt) => {
                Ok(Codec::Opus(opus::OpusCodec::new(opus_rate_hint.unwrap_or(48000))?))
            }
            other => Err(CodecError::UnsupportedPayloadType(other)),
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Pcmu | Codec::Pcma | Codec::G729(_) => 8000,
            Codec::Opus(_) => 48000,
        }
    }

    /// Number of PCM samples carried by one 20ms RTP packet for this codec.
    pub fn frame_samples(&self) -> usize {
        match self {
            Codec::Pcmu | Codec::Pcma | Codec::G729(_) => 160,
            Codec::Opus(c) => c.frame_samples(),
        }
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        match self {
            Codec::Pcmu => Ok(g711::decode_ulaw_buf(payload)),
            Codec::Pcma => Ok(g711::decode_alaw_buf(payload)),
            Codec::Opus(c) => c.decode(payload),
            Codec::G729(c) => c.decode(payload),
        }
    }

    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Pcmu => Ok(g711::encode_ulaw_buf(pcm)),
            Codec::Pcma => Ok(g711::encode_alaw_buf(pcm)),
            Codec::Opus(c) => c.encode(pcm),
            Codec::G729(c) => c.encode(pcm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcmu_round_trips_frame_size() {
        let mut codec = Codec::for_payload_type(PT_PCMU, None).unwrap();
        let pcm = vec![0i16; 160];
        let encoded = codec.encode(&pcm).unwrap();
        assert_eq!(encoded.len(), 160);
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), 160);
    }

    #[test]
    fn unknown_static_payload_type_is_rejected() {
        assert!(Codec::for_payload_type(3, None).is_err());
    }
}
