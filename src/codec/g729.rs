//! G.729 Annex A wrapper over `libbcg729` (8kHz/16-bit PCM, 10ms frames,
//! fixed 8kbit/s, 10-byte bitstream per frame). Gated behind the `g729`
//! feature; the FFI surface mirrors `initBcg729DecoderChannel` /
//! `bcg729Decoder` / `closeBcg729DecoderChannel` and their encoder
//! counterparts one-for-one.

use crate::error::CodecError;

pub const FRAME_SAMPLES: usize = 80;
pub const FRAME_BYTES: usize = 10;

#[cfg(feature = "g729")]
mod ffi {
    #![allow(non_snake_case, non_camel_case_types)]
    use std::os::raw::{c_int, c_uchar};

    pub enum G729DecoderChannel {}
    pub enum G729EncoderChannel {}

    extern "C" {
        pub fn initBcg729DecoderChannel() -> *mut G729DecoderChannel;
        pub fn closeBcg729DecoderChannel(channel: *mut G729DecoderChannel);
        pub fn bcg729Decoder(
            channel: *mut G729DecoderChannel,
            bitstream: *const c_uchar,
            frame_size: c_uchar,
            erasure_flag: c_uchar,
            sid_flag: c_uchar,
            rfc3389_flag: c_uchar,
            pcm: *mut i16,
        );

        pub fn initBcg729EncoderChannel(vad_enabled: c_uchar) -> *mut G729EncoderChannel;
        pub fn closeBcg729EncoderChannel(channel: *mut G729EncoderChannel);
        pub fn bcg729Encoder(
            channel: *mut G729EncoderChannel,
            pcm: *const i16,
            bitstream: *mut c_uchar,
            bitstream_length: *mut c_uchar,
        );
    }

    // silence unused import warnings when the feature is on but c_int unused
    #[allow(dead_code)]
    fn _unused(_: c_int) {}
}

#[cfg(feature = "g729")]
pub struct G729Codec {
    decoder: *mut ffi::G729DecoderChannel,
    encoder: *mut ffi::G729EncoderChannel,
}

#[cfg(feature = "g729")]
unsafe impl Send for G729Codec {}

#[cfg(feature = "g729")]
impl G729Codec {
    pub fn new() -> Result<Self, CodecError> {
        unsafe {
            let decoder = ffi::initBcg729DecoderChannel();
            if decoder.is_null() {
                return Err(CodecError::G729("failed to create decoder channel".into()));
            }
            let encoder = ffi::initBcg729EncoderChannel(0);
            if encoder.is_null() {
                ffi::closeBcg729DecoderChannel(decoder);
                return Err(CodecError::G729("failed to create encoder channel".into()));
            }
            Ok(Self { decoder, encoder })
        }
    }

    /// Decode an RTP payload (a multiple of 10 bytes, Cisco commonly sends
    /// 20 bytes per 20ms packet) into mono PCM16, 80 samples per 10-byte frame.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut out = Vec::with_capacity((payload.len() / FRAME_BYTES) * FRAME_SAMPLES);
        for chunk in payload.chunks(FRAME_BYTES) {
            let mut pcm = vec![0i16; chunk.len() * 8];
            unsafe {
                ffi::bcg729Decoder(
                    self.decoder,
                    chunk.as_ptr(),
                    chunk.len() as u8,
                    0,
                    0,
                    0,
                    pcm.as_mut_ptr(),
                );
            }
            out.extend_from_slice(&pcm);
        }
        Ok(out)
    }

    /// Encode mono PCM16 into a G.729A bitstream. `pcm` must be a multiple
    /// of 80 samples; each 80-sample frame yields at most 10 bytes.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity((pcm.len() / FRAME_SAMPLES) * FRAME_BYTES);
        for frame in pcm.chunks(FRAME_SAMPLES) {
            let mut bitstream = [0u8; FRAME_BYTES];
            let mut length: u8 = 0;
            unsafe {
                ffi::bcg729Encoder(
                    self.encoder,
                    frame.as_ptr(),
                    bitstream.as_mut_ptr(),
                    &mut length,
                );
            }
            out.extend_from_slice(&bitstream[..length as usize]);
        }
        Ok(out)
    }
}

#[cfg(feature = "g729")]
impl Drop for G729Codec {
    fn drop(&mut self) {
        unsafe {
            ffi::closeBcg729DecoderChannel(self.decoder);
            ffi::closeBcg729EncoderChannel(self.encoder);
        }
    }
}

#[cfg(not(feature = "g729"))]
pub struct G729Codec;

#[cfg(not(feature = "g729"))]
impl G729Codec {
    pub fn new() -> Result<Self, CodecError> {
        Err(CodecError::FeatureDisabled("g729"))
    }

    pub fn decode(&mut self, _payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        Err(CodecError::FeatureDisabled("g729"))
    }

    pub fn encode(&mut self, _pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::FeatureDisabled("g729"))
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn frame_constants_match_the_wire_contract() {
        assert_eq!(super::FRAME_SAMPLES, 80);
        assert_eq!(super::FRAME_BYTES, 10);
    }
}
