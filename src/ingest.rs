// 📥 Ingestion - CSV snapshots to queue items
//
// Layout: type, source_system_name, source_system_id, point_in_time, then one
// column per attribute named by its header. Blank cells are absent values.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

use crate::entities::EntitySnapshot;
use crate::reconciliation::SyncItem;
use crate::temporal::parse_instant;

const FIXED_COLUMNS: usize = 4;

pub fn load_csv(csv_path: &Path) -> Result<Vec<SyncItem>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file {}", csv_path.display()))?;

    let headers = rdr.headers().context("Failed to read CSV header")?.clone();
    if headers.len() < FIXED_COLUMNS {
        bail!(
            "CSV header must start with type, source_system_name, source_system_id, point_in_time (got {} columns)",
            headers.len()
        );
    }

    let mut items = Vec::new();
    for (index, result) in rdr.records().enumerate() {
        let line = index + 2;
        let record = result.with_context(|| format!("Failed to read CSV line {}", line))?;

        let field = |i: usize| record.get(i).map(str::trim).unwrap_or("");
        let (entity_type, source, id, at) = (field(0), field(1), field(2), field(3));
        if entity_type.is_empty() || source.is_empty() || id.is_empty() {
            bail!("line {}: type, source_system_name and source_system_id are required", line);
        }
        let point_in_time = parse_instant(at)
            .with_context(|| format!("line {}: invalid point_in_time '{}'", line, at))?;

        let mut snapshot = EntitySnapshot::new(entity_type, source, id);
        for (name, value) in headers.iter().zip(record.iter()).skip(FIXED_COLUMNS) {
            snapshot.set_attribute(name.trim(), value);
        }

        items.push(SyncItem::new(snapshot, point_in_time));
    }

    info!(path = %csv_path.display(), count = items.len(), "loaded snapshots from CSV");
    Ok(items)
}
