//! `deepeyes results` and `deepeyes instances`: read-side listings.

use anyhow::Result;

use deepeyes_core::{CheckpointStore, InstanceRecord, ResultStore, ScanResult};

use crate::terminal_output::{dim, render_table, status_label, Column};

pub async fn run_results(store: &dyn ResultStore, json: bool) -> Result<()> {
    let results = store.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("{}", dim("No results stored yet."));
    } else {
        print!("{}", results_table(&results));
    }
    Ok(())
}

pub async fn run_instances(store: &dyn CheckpointStore, limit: usize, json: bool) -> Result<()> {
    let instances = store.list_instances(limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
    } else if instances.is_empty() {
        println!("{}", dim("No workflow instances recorded."));
    } else {
        print!("{}", instances_table(&instances));
    }
    Ok(())
}

fn results_table(results: &[ScanResult]) -> String {
    let columns = vec![
        Column::left("Id").max(36),
        Column::left("Image").max(32),
        Column::left("Tags").max(40),
        Column::left("OCR"),
        Column::right("Lines"),
        Column::left("Updated"),
    ];
    let rows: Vec<Vec<String>> = results
        .iter()
        .map(|r| {
            vec![
                r.id.clone(),
                r.image.clone(),
                r.tags.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", "),
                status_label(r.ocr.state.as_str()),
                r.ocr.lines.len().to_string(),
                r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    render_table(&columns, &rows)
}

fn instances_table(instances: &[InstanceRecord]) -> String {
    let columns = vec![
        Column::left("Instance"),
        Column::left("Status"),
        Column::left("Owner").max(24),
        Column::left("Updated"),
        Column::left("Error").max(60),
    ];
    let rows: Vec<Vec<String>> = instances
        .iter()
        .map(|i| {
            let mut status = i.status.to_string();
            if i.cancel_requested && !i.status.is_terminal() {
                status.push_str(" (cancelling)");
            }
            vec![
                i.id.to_string(),
                status_label(&status),
                i.lease_owner.clone().unwrap_or_default(),
                i.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                i.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    render_table(&columns, &rows)
}
