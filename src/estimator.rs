use crate::{
    formats::FormatSpec,
    ytdlp::{MediaProvider, ProbeInfo},
};
use tracing::debug;

/// Best-effort probe summary for one format choice. `bytes == 0` means the
/// size is unknown, not that the file is empty.
#[derive(Debug, Default)]
pub struct Estimate {
    pub bytes: u64,
    pub title: Option<String>,
}

/// Predicts the output size of a download via a dry-run probe, carrying the
/// probed title along for the status message. Estimation never propagates a
/// failure: a geo-blocked or private video simply shows no size next to its
/// format key.
pub async fn estimate(provider: &dyn MediaProvider, url: &str, spec: &FormatSpec) -> Estimate {
    match provider.probe(url, spec.selector).await {
        Ok(info) => Estimate {
            bytes: estimate_from_probe(&info),
            title: info.title,
        },
        Err(err) => {
            debug!(event = "estimate_failed", format = %spec.key, error = %err);
            Estimate::default()
        }
    }
}

/// Exact stream size when the probe reports one; otherwise bitrate × duration.
pub fn estimate_from_probe(info: &ProbeInfo) -> u64 {
    if let Some(exact) = exact_size(info) {
        return exact;
    }
    let bitrate_kbps = match bitrate_kbps(info) {
        Some(b) if b > 0.0 => b,
        _ => return 0,
    };
    let duration = match info.duration {
        Some(d) if d > 0.0 => d,
        _ => return 0,
    };
    (bitrate_kbps * 1000.0 * duration / 8.0) as u64
}

fn exact_size(info: &ProbeInfo) -> Option<u64> {
    if !info.requested_formats.is_empty() {
        // A merged selection is exact only when every component stream is.
        return info
            .requested_formats
            .iter()
            .map(|f| f.filesize)
            .sum::<Option<u64>>();
    }
    info.filesize.or(info.filesize_approx)
}

fn bitrate_kbps(info: &ProbeInfo) -> Option<f64> {
    if let Some(tbr) = info.tbr {
        return Some(tbr);
    }
    let total: f64 = info
        .requested_formats
        .iter()
        .filter_map(|f| f.tbr)
        .sum();
    if total > 0.0 {
        Some(total)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::AppError, ytdlp::RequestedFormat};
    use async_trait::async_trait;

    #[test]
    fn exact_stream_size_wins() {
        let info = ProbeInfo {
            filesize: Some(123_456),
            tbr: Some(1000.0),
            duration: Some(600.0),
            ..Default::default()
        };
        assert_eq!(estimate_from_probe(&info), 123_456);
    }

    #[test]
    fn merged_streams_sum_their_exact_sizes() {
        let info = ProbeInfo {
            requested_formats: vec![
                RequestedFormat { ext: Some("mp4".into()), filesize: Some(1000), tbr: None },
                RequestedFormat { ext: Some("m4a".into()), filesize: Some(200), tbr: None },
            ],
            ..Default::default()
        };
        assert_eq!(estimate_from_probe(&info), 1200);
    }

    #[test]
    fn approximate_size_fills_in_for_a_missing_exact_one() {
        let info = ProbeInfo {
            filesize_approx: Some(9_999),
            tbr: Some(1000.0),
            duration: Some(600.0),
            ..Default::default()
        };
        assert_eq!(estimate_from_probe(&info), 9_999);
    }

    #[test]
    fn bitrate_times_duration_when_no_exact_size() {
        let info = ProbeInfo {
            tbr: Some(800.0),
            duration: Some(60.0),
            ..Default::default()
        };
        // floor(800 * 1000 * 60 / 8)
        assert_eq!(estimate_from_probe(&info), 6_000_000);
    }

    #[test]
    fn partial_merged_sizes_fall_back_to_bitrate() {
        let info = ProbeInfo {
            duration: Some(10.0),
            requested_formats: vec![
                RequestedFormat { ext: None, filesize: Some(1000), tbr: Some(100.0) },
                RequestedFormat { ext: None, filesize: None, tbr: Some(28.0) },
            ],
            ..Default::default()
        };
        // floor((100 + 28) * 1000 * 10 / 8)
        assert_eq!(estimate_from_probe(&info), 160_000);
    }

    #[test]
    fn unknown_when_neither_size_nor_bitrate() {
        let info = ProbeInfo {
            duration: Some(60.0),
            ..Default::default()
        };
        assert_eq!(estimate_from_probe(&info), 0);
        assert_eq!(estimate_from_probe(&ProbeInfo::default()), 0);
    }

    struct FailingProvider;

    #[async_trait]
    impl MediaProvider for FailingProvider {
        async fn probe(&self, _url: &str, _selector: &str) -> Result<ProbeInfo, AppError> {
            Err(AppError::YtDlp("ERROR: Private video".into()))
        }
    }

    #[tokio::test]
    async fn probe_failure_reports_unknown_instead_of_propagating() {
        let spec = crate::formats::lookup("720").unwrap();
        let estimate = estimate(&FailingProvider, "https://youtu.be/x", spec).await;
        assert_eq!(estimate.bytes, 0);
        assert_eq!(estimate.title, None);
    }

    struct TitledProvider;

    #[async_trait]
    impl MediaProvider for TitledProvider {
        async fn probe(&self, _url: &str, _selector: &str) -> Result<ProbeInfo, AppError> {
            Ok(ProbeInfo {
                title: Some("clip".into()),
                filesize: Some(512),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn successful_probe_carries_the_title() {
        let spec = crate::formats::lookup("720").unwrap();
        let estimate = estimate(&TitledProvider, "https://youtu.be/x", spec).await;
        assert_eq!(estimate.bytes, 512);
        assert_eq!(estimate.title.as_deref(), Some("clip"));
    }
}
