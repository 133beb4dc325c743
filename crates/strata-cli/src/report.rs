use anyhow::Result;
use strata_db::{ChecksumMismatch, Direction, HistoryEntry, MigrationPlan, MigrationStatus};

pub fn print_plan(plan: &MigrationPlan) {
    let Some(direction) = plan.direction else {
        println!("Schema is at version {}, nothing to do.", plan.current);
        return;
    };
    println!(
        "{} from version {} to {}:",
        match direction {
            Direction::Up => "Upgrade",
            Direction::Down => "Downgrade",
        },
        plan.current,
        plan.target
    );
    for version in &plan.versions {
        println!("  {version:03}");
    }
}

pub fn print_applied(applied: &[u32], version: u32) {
    if applied.is_empty() {
        println!("Schema already at version {version}.");
    } else {
        let list: Vec<String> = applied.iter().map(|v| format!("{v:03}")).collect();
        println!("Ran {}; schema now at version {version}.", list.join(", "));
    }
}

pub fn print_status(status: &MigrationStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    let applied_at = status
        .applied_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!("  Current:  {}{}", status.current, if status.dirty { " (dirty)" } else { "" });
    println!("  Latest:   {}", status.latest);
    println!("  Backend:  {}", status.backend);
    println!("  Applied:  {applied_at}");
    if status.pending.is_empty() {
        println!("  Pending:  none");
    } else {
        let list: Vec<String> = status.pending.iter().map(u32::to_string).collect();
        println!("  Pending:  {}", list.join(", "));
    }
    if status.dirty {
        println!();
        println!(
            "  Migration {} did not finish. Repair the schema, then run `strata force-version`.",
            status.current
        );
    }
    Ok(())
}

pub fn print_history(entries: &[HistoryEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No migrations have run.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {:03}_{:<32} {:<4} {:>6} ms",
            entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
            entry.version,
            entry.slug,
            entry.direction.as_str(),
            entry.duration_ms
        );
    }
    Ok(())
}

pub fn print_mismatches(mismatches: &[ChecksumMismatch]) {
    if mismatches.is_empty() {
        println!("All applied migrations match their recorded checksums.");
        return;
    }
    for m in mismatches {
        match &m.recorded {
            Some(recorded) => println!(
                "{:03}_{}: changed since applied (recorded {}, now {})",
                m.version,
                m.slug,
                short(recorded),
                short(&m.current)
            ),
            None => println!("{:03}_{}: no recorded checksum", m.version, m.slug),
        }
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
