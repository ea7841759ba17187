//! End-of-shot CSV export: the full tick trace and a per-phase summary,
//! one pair of files per shot. Export failures are logged, never fatal —
//! losing an export must not take the engine down.

use csv::Writer;
use log::{error, info};
use serde::Serialize;
use std::fs::create_dir_all;
use std::path::Path;

use crate::shot::recorder::ShotRecord;

#[derive(Serialize)]
struct SummaryRow<'a> {
    metric: &'a str,
    value: String,
    description: &'a str,
}

/// Write `<dir>/shot_<id>_trace.csv` and `<dir>/shot_<id>_summary.csv`.
pub fn export_shot(record: &ShotRecord, dir: &Path) {
    if let Err(e) = create_dir_all(dir) {
        error!("failed to create export directory {dir:?}: {e}");
        return;
    }

    let trace_path = dir.join(format!("shot_{}_trace.csv", record.shot_id));
    match Writer::from_path(&trace_path) {
        Ok(mut wtr) => {
            for sample in &record.trace {
                if let Err(e) = wtr.serialize(sample) {
                    error!("trace row write failed: {e}");
                    break;
                }
            }
            let _ = wtr.flush();
        }
        Err(e) => {
            error!("failed to create {trace_path:?}: {e}");
            return;
        }
    }

    let summary_path = dir.join(format!("shot_{}_summary.csv", record.shot_id));
    match Writer::from_path(&summary_path) {
        Ok(mut wtr) => {
            let rows = summary_rows(record);
            for row in &rows {
                if let Err(e) = wtr.serialize(row) {
                    error!("summary row write failed: {e}");
                    break;
                }
            }
            let _ = wtr.flush();
            info!(
                "shot {} exported: {} trace rows, {} summary rows",
                record.shot_id,
                record.trace.len(),
                rows.len()
            );
        }
        Err(e) => error!("failed to create {summary_path:?}: {e}"),
    }
}

fn summary_rows(record: &ShotRecord) -> Vec<SummaryRow<'_>> {
    let mut rows = vec![
        SummaryRow {
            metric: "profile",
            value: record.profile.clone(),
            description: "profile name",
        },
        SummaryRow {
            metric: "duration_s",
            value: format!("{:.2}", record.duration),
            description: "total shot time",
        },
        SummaryRow {
            metric: "final_weight_g",
            value: format!("{:.1}", record.final_weight),
            description: "weight in cup at shot end",
        },
        SummaryRow {
            metric: "peak_pressure_bar",
            value: format!("{:.2}", record.peak_pressure),
            description: "highest pressure seen",
        },
        SummaryRow {
            metric: "avg_pressure_bar",
            value: format!("{:.2}", record.avg_pressure),
            description: "mean pressure over the shot",
        },
        SummaryRow {
            metric: "pressure_stability_pct",
            value: format!("{:.1}", record.pressure_stability),
            description: "100 minus pressure coefficient of variation",
        },
        SummaryRow {
            metric: "peak_flow_ml_s",
            value: format!("{:.2}", record.peak_flow),
            description: "highest flow seen",
        },
        SummaryRow {
            metric: "avg_flow_ml_s",
            value: format!("{:.2}", record.avg_flow),
            description: "mean flow over the shot",
        },
        SummaryRow {
            metric: "flow_stability_pct",
            value: format!("{:.1}", record.flow_stability),
            description: "100 minus flow coefficient of variation",
        },
    ];

    if let Some(reason) = record.abort_reason {
        rows.push(SummaryRow {
            metric: "abort_reason",
            value: reason.to_string(),
            description: "why the shot was aborted",
        });
    }

    for phase in &record.phases {
        rows.push(SummaryRow {
            metric: "phase",
            value: format!(
                "{} `{}`: {:.1}s, overshoot {}, settling {}, avg {:.2} bar / {:.2} ml/s, +{:.1}g",
                phase.index,
                phase.name,
                phase.duration,
                phase
                    .peak_overshoot
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "n/a".into()),
                phase
                    .settling_time
                    .map(|v| format!("{v:.1}s"))
                    .unwrap_or_else(|| "n/a".into()),
                phase.avg_pressure,
                phase.avg_flow,
                phase.weight_gain,
            ),
            description: "per-phase breakdown",
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Algorithm, BreakoutCriterion, ControlMode, Phase, Profile};
    use crate::shot::recorder::{ShotRecorder, TraceSample};

    #[test]
    fn export_writes_both_files() {
        let profile = Profile {
            name: "test".into(),
            technique: String::new(),
            default_dose: 18.0,
            default_yield: 36.0,
            default_ratio: 2.0,
            phases: vec![Phase {
                name: "extraction".into(),
                control: ControlMode::Pressure { target: 9.0 },
                algorithm: Algorithm::Pid,
                max_duration: 45.0,
                breakout: vec![BreakoutCriterion::Time { seconds: 30.0 }],
            }],
        };
        let mut rec = ShotRecorder::begin(42, &profile, 0.02);
        rec.push(TraceSample {
            elapsed: 0.05,
            phase: 0,
            target: 9.0,
            actual: 8.7,
            command: 0.6,
            pressure: Some(8.7),
            flow: Some(1.8),
            weight: Some(0.1),
        });
        let record = rec.finish(None);

        let dir = std::env::temp_dir().join("brew_engine_export_test");
        export_shot(&record, &dir);
        assert!(dir.join("shot_42_trace.csv").exists());
        assert!(dir.join("shot_42_summary.csv").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
