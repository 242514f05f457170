//! Montage planning and the plain-text summary.

use std::path::{Path, PathBuf};

use clip_core::{ClipSpec, ContradictionDetail, ContradictionSide, MontagePlan};

/// Two clips per contradiction, side a then side b, in selection order.
///
/// Each clip starts `lead_in` seconds before its segment (never before 0)
/// and runs for `clip_duration` seconds.
pub fn plan_montage(
    details: &[ContradictionDetail],
    output: &Path,
    lead_in: f64,
    clip_duration: f64,
) -> MontagePlan {
    let clip = |side: &ContradictionSide, rank: usize| {
        let start_ts = (side.segment.start_ts - lead_in).max(0.0);
        ClipSpec {
            source: side.file.stored_path.clone(),
            start_ts,
            end_ts: start_ts + clip_duration,
            rank,
        }
    };

    let clips = details
        .iter()
        .enumerate()
        .flat_map(|(rank, d)| [clip(&d.a, rank), clip(&d.b, rank)])
        .collect();

    MontagePlan {
        clips,
        output: PathBuf::from(output),
    }
}

/// One human-readable line per contradiction.
pub fn format_summary_line(detail: &ContradictionDetail) -> String {
    let (a, b) = (&detail.a, &detail.b);
    format!(
        "In video {} at {:.1}-{:.1}s: \"{}\". This contradicts video {} at {:.1}-{:.1}s: \"{}\".",
        a.file.label(),
        a.segment.start_ts,
        a.segment.end_ts,
        a.segment.text.trim(),
        b.file.label(),
        b.segment.start_ts,
        b.segment.end_ts,
        b.segment.text.trim(),
    )
}

/// Summary file body: one line per contradiction, newline terminated.
pub(crate) fn render_summary(details: &[ContradictionDetail]) -> String {
    details
        .iter()
        .map(|d| format_summary_line(d) + "\n")
        .collect()
}
