//! WebRTC engine adapter and SDP inspection
pub mod rtc;
pub mod sdp;

pub use rtc::{WebRtcFactory, WebRtcLocalTrack, WebRtcRemoteTrack};
pub use sdp::{ice_ufrag, mid_ssrc_map, ssrc_fixups, MidSsrcMap, SdpView};
