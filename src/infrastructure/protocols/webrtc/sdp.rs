/// SDP inspection helpers
///
/// The session never edits descriptions; it only reads the transport section
/// ids (`a=mid`), the sender ssrc of each section and the ICE credentials.
use crate::domain::shared::{Result, SessionError};
use std::collections::{BTreeMap, HashMap};

/// mid → ssrc of the single sender in that section
pub type MidSsrcMap = HashMap<String, String>;

/// ICE credentials (`a=ice-ufrag` / `a=ice-pwd`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// One `m=` section
#[derive(Debug, Clone, Default)]
pub struct MediaSection {
    /// First token of the `m=` line: audio, video, application
    pub media_type: String,
    pub mid: Option<String>,
    /// Distinct ssrcs in order of appearance, with their attribute names
    pub ssrcs: Vec<(String, Vec<String>)>,
}

impl MediaSection {
    fn new(m_line: &str) -> Self {
        Self {
            media_type: m_line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
            ..Self::default()
        }
    }

    fn add_ssrc(&mut self, ssrc: &str, attribute: &str) {
        match self.ssrcs.iter_mut().find(|(s, _)| s == ssrc) {
            Some((_, attributes)) => attributes.push(attribute.to_string()),
            None => self
                .ssrcs
                .push((ssrc.to_string(), vec![attribute.to_string()])),
        }
    }

    /// The ssrc of a single-sender section; simulcast sections carry several
    pub fn single_ssrc(&self) -> Option<&str> {
        match self.ssrcs.as_slice() {
            [(ssrc, _)] => Some(ssrc),
            _ => None,
        }
    }
}

/// Parsed view of a session description
#[derive(Debug, Clone, Default)]
pub struct SdpView {
    pub ice: Option<IceCredentials>,
    pub sections: Vec<MediaSection>,
}

impl SdpView {
    /// Parse the parts of `sdp` the session cares about.
    ///
    /// A second `a=mid` before the next `m=` line is a protocol error.
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut view = SdpView::default();
        let mut ufrag = None;
        let mut pwd = None;
        let mut current: Option<MediaSection> = None;

        for line in sdp.lines().map(str::trim_end) {
            if let Some(m_line) = line.strip_prefix("m=") {
                if let Some(section) = current.take() {
                    view.sections.push(section);
                }
                current = Some(MediaSection::new(m_line));
            } else if let Some(mid) = line.strip_prefix("a=mid:") {
                let Some(section) = current.as_mut() else {
                    continue;
                };
                if let Some(existing) = &section.mid {
                    return Err(SessionError::Protocol(format!(
                        "a=mid found twice in one section: {}, {}",
                        existing, mid
                    )));
                }
                section.mid = Some(mid.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("a=ssrc:") {
                let Some(section) = current.as_mut() else {
                    continue;
                };
                let mut parts = rest.splitn(2, char::is_whitespace);
                let ssrc = parts.next().unwrap_or_default().trim();
                let attribute = parts
                    .next()
                    .and_then(|a| a.split(':').next())
                    .unwrap_or_default()
                    .trim();
                if !ssrc.is_empty() {
                    section.add_ssrc(ssrc, attribute);
                }
            } else if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                ufrag.get_or_insert_with(|| value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
                pwd.get_or_insert_with(|| value.trim().to_string());
            }
        }
        if let Some(section) = current {
            view.sections.push(section);
        }
        if let (Some(ufrag), Some(pwd)) = (ufrag, pwd) {
            view.ice = Some(IceCredentials { ufrag, pwd });
        }
        Ok(view)
    }

    /// mid → ssrc for every section with a mid and exactly one ssrc
    pub fn mid_ssrc_map(&self) -> MidSsrcMap {
        self.sections
            .iter()
            .filter_map(|s| Some((s.mid.clone()?, s.single_ssrc()?.to_string())))
            .collect()
    }
}

pub fn mid_ssrc_map(sdp: &str) -> Result<MidSsrcMap> {
    Ok(SdpView::parse(sdp)?.mid_ssrc_map())
}

/// First `a=ice-ufrag` value; the remote one doubles as the session id
pub fn ice_ufrag(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|l| l.trim_end().strip_prefix("a=ice-ufrag:"))
        .map(|v| v.trim().to_string())
}

/// `[[old, new]]` ssrc pairs per mid, for every mid known before the answer.
///
/// A mid missing from the answer is paired with 0.
pub fn ssrc_fixups(before: &MidSsrcMap, after: &MidSsrcMap) -> BTreeMap<String, [u64; 2]> {
    before
        .iter()
        .map(|(mid, old)| {
            let new = after.get(mid).and_then(|s| s.parse().ok()).unwrap_or(0);
            (mid.clone(), [old.parse().unwrap_or(0), new])
        })
        .collect()
}
