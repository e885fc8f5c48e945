use crate::peer::types::IceCandidate;
use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Candidate counts by type, taken once gathering completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

/// Reads the `typ` attribute of a candidate line.
pub fn candidate_type(candidate: &str) -> Option<&str> {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return parts.next();
        }
    }
    None
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        match candidate_type(&candidate.candidate) {
            Some("host") => summary.host += 1,
            Some("srflx") | Some("prflx") => summary.srflx += 1,
            Some("relay") => summary.relay += 1,
            _ => {}
        }
    }

    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate gathering finished"
    );
    if summary.relay == 0 && summary.srflx == 0 {
        warn!("no reflexive or relay candidates; peers behind NAT may not connect");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn reads_candidate_type() {
        assert_eq!(
            candidate_type("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host"),
            Some("host")
        );
        assert_eq!(
            candidate_type("candidate:2 1 udp 1694498815 1.2.3.4 5000 typ srflx raddr 10.0.0.2 rport 5000"),
            Some("srflx")
        );
        assert_eq!(candidate_type("garbage"), None);
    }

    #[test]
    fn summary_counts_types() {
        let summary = analyze_candidates(&[
            cand("candidate:1 1 udp 1 10.0.0.2 5000 typ host"),
            cand("candidate:2 1 udp 1 1.2.3.4 5000 typ srflx"),
            cand("candidate:3 1 udp 1 5.6.7.8 3478 typ relay"),
            cand("candidate:4 1 udp 1 10.0.0.3 5001 typ host"),
        ]);
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[test]
    fn converts_to_and_from_webrtc_init() {
        let original = cand("candidate:1 1 udp 1 10.0.0.2 5000 typ host");
        let init: RTCIceCandidateInit = original.clone().into();
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), original);
    }
}
