use crate::core::{RunId, StoreError};
use crate::storage::RunStore;
use thiserror::Error;

pub const CSV_HEADER: [&str; 8] = [
    "run_id", "method_id", "name", "label", "step", "t", "error_b", "error_a",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("run not found")]
    RunNotFound(RunId),

    #[error("no point data yet")]
    NoData(RunId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Attachment name offered to clients.
pub fn csv_filename(run_id: RunId) -> String {
    let id = run_id.to_string();
    format!("teda_run_{}.csv", &id[..8])
}

/// Every point of the run joined with its method's name and label, in
/// `(method_id, step)` order, as CSV with CRLF line endings.
pub async fn export_points_csv(store: &dyn RunStore, run_id: RunId) -> Result<String, ExportError> {
    if store.get_run(run_id).await?.is_none() {
        return Err(ExportError::RunNotFound(run_id));
    }

    let points = store.fetch_points(run_id).await?;
    if points.is_empty() {
        return Err(ExportError::NoData(run_id));
    }
    let methods = store.get_methods(run_id).await?;

    let mut out = String::new();
    write_row(&mut out, CSV_HEADER.iter().map(|h| h.to_string()));
    for point in &points {
        let (name, label) = methods
            .get(&point.method_id)
            .map(|m| (m.name.as_str(), m.label.as_str()))
            .unwrap_or(("", ""));
        write_row(
            &mut out,
            [
                point.run_id.to_string(),
                point.method_id.clone(),
                name.to_string(),
                label.to_string(),
                point.step.to_string(),
                format_float(point.t),
                format_float(point.error_b),
                format_float(point.error_a),
            ],
        );
    }
    Ok(out)
}

fn write_row(out: &mut String, fields: impl IntoIterator<Item = String>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&quote_field(&field));
    }
    out.push_str("\r\n");
}

/// Quote only when the field would otherwise be ambiguous.
fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Shortest round-trip form, always with a fractional part (`0.0`, `0.1`).
fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value == f64::INFINITY {
        "inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{value:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MethodInstance, MethodStatus, Params, Point, PointSample, RunConfig};
    use crate::storage::JournaledStore;
    use uuid::Uuid;

    async fn seeded_store() -> (JournaledStore, RunId) {
        let store = JournaledStore::in_memory();
        let run_id = Uuid::new_v4();
        store.create_run(run_id, &RunConfig::default()).await.unwrap();
        for (method_id, label) in [("b", "plain"), ("a", "local, r=2")] {
            store
                .upsert_method(MethodInstance {
                    run_id,
                    method_id: method_id.to_string(),
                    name: "enkf".to_string(),
                    label: label.to_string(),
                    params: Params::new(),
                    status: MethodStatus::Running,
                    metrics: None,
                    runtime_sec: None,
                })
                .await
                .unwrap();
            for step in 0..2u32 {
                store
                    .upsert_point(Point::new(
                        run_id,
                        method_id,
                        PointSample {
                            step,
                            t: step as f64 * 0.1,
                            error_b: 0.5,
                            error_a: 0.25,
                        },
                    ))
                    .await
                    .unwrap();
            }
        }
        (store, run_id)
    }

    #[tokio::test]
    async fn test_csv_rows_follow_method_then_step() {
        let (store, run_id) = seeded_store().await;
        let csv = export_points_csv(&store, run_id).await.unwrap();
        let lines: Vec<&str> = csv.split_terminator("\r\n").collect();

        assert_eq!(lines[0], "run_id,method_id,name,label,step,t,error_b,error_a");
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], format!("{run_id},a,enkf,\"local, r=2\",0,0.0,0.5,0.25"));
        assert_eq!(lines[2], format!("{run_id},a,enkf,\"local, r=2\",1,0.1,0.5,0.25"));
        assert_eq!(lines[3], format!("{run_id},b,enkf,plain,0,0.0,0.5,0.25"));
    }

    #[tokio::test]
    async fn test_missing_run_and_empty_run_are_distinct() {
        let store = JournaledStore::in_memory();
        assert!(matches!(
            export_points_csv(&store, Uuid::new_v4()).await,
            Err(ExportError::RunNotFound(_))
        ));

        let run_id = Uuid::new_v4();
        store.create_run(run_id, &RunConfig::default()).await.unwrap();
        assert!(matches!(
            export_points_csv(&store, run_id).await,
            Err(ExportError::NoData(_))
        ));
    }

    #[test]
    fn test_filename_uses_id_prefix() {
        let run_id = Uuid::parse_str("1234abcd-0000-4000-8000-000000000000").unwrap();
        assert_eq!(csv_filename(run_id), "teda_run_1234abcd.csv");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_field("plain"), "plain");
        assert_eq!(quote_field("a,b"), "\"a,b\"");
        assert_eq!(quote_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
