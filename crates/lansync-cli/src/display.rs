//! Terminal output helpers

use console::style;
use lansync_engine::{EngineStats, SyncEvent};
use lansync_types::SyncStats;
use std::time::Duration;

pub fn print_sync_stats(peer_id: &str, stats: &SyncStats) {
    println!();
    println!("{}", style(format!("Sync with {}:", peer_id)).bold().underlined());
    println!("  Files downloaded: {}", style(stats.files_downloaded).green());
    println!(
        "  Bytes downloaded: {}",
        style(format_bytes(stats.bytes_downloaded)).green()
    );
    println!("  Files to upload: {}", style(stats.files_to_upload).cyan());
    println!("  Conflicts: {}", style(stats.conflicts).yellow());
    println!("  Files skipped: {}", style(stats.files_skipped).yellow());
    println!(
        "  Errors: {}",
        if stats.errors > 0 {
            style(stats.errors).red()
        } else {
            style(stats.errors).green()
        }
    );
    for path in &stats.failed_paths {
        println!("    {} {}", style("✗").red(), path);
    }
    println!(
        "  Duration: {}",
        style(format_duration(Duration::from_millis(stats.duration_ms))).blue()
    );
}

pub fn print_engine_stats(stats: &EngineStats) {
    println!();
    println!("{}", style("Node Statistics:").bold().underlined());
    println!(
        "  Peers: {} known, {} online",
        stats.known_peers,
        style(stats.online_peers).green()
    );
    println!("  Local files: {}", stats.local_files);
    println!(
        "  Sessions: {} completed, {} failed",
        style(stats.sessions.sessions_completed).green(),
        style(stats.sessions.sessions_failed).red()
    );
    println!(
        "  Received: {} files, {}",
        stats.sessions.files_synced,
        format_bytes(stats.sessions.bytes_received)
    );
    println!(
        "  Served: {} files, {}",
        stats.files_served,
        format_bytes(stats.bytes_sent)
    );
    println!("  Errors: {}", stats.errors);
    println!(
        "  Uptime: {}",
        format_duration(Duration::from_secs(stats.uptime_secs))
    );
}

pub fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::PeerDiscovered { peer } => format!(
            "{} {} ({}) at {}",
            style("+").green().bold(),
            peer.display_name,
            peer.id,
            peer.address
        ),
        SyncEvent::PeerLeft { peer_id } => format!("{} {} left", style("-").red().bold(), peer_id),
        SyncEvent::SyncStarted { peer_id } => {
            format!("{} Syncing with {}", style("⟲").blue().bold(), peer_id)
        }
        SyncEvent::SyncCompleted { peer_id, stats } => format!(
            "{} Synced with {}: {} files, {} errors",
            style("✓").green(),
            peer_id,
            stats.files_downloaded,
            stats.errors
        ),
        SyncEvent::SyncFailed { peer_id, error, .. } => {
            format!("{} Sync with {} failed: {}", style("✗").red(), peer_id, error)
        }
        SyncEvent::FileSynced {
            peer_id,
            path,
            bytes,
        } => format!(
            "  {} {} ({}) from {}",
            style("↓").cyan(),
            path,
            format_bytes(*bytes),
            peer_id
        ),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "0.00 B")]
    #[case(1023, "1023.00 B")]
    #[case(1024, "1.00 KB")]
    #[case(10 * 1024 * 1024, "10.00 MB")]
    fn test_format_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[rstest]
    #[case(Duration::from_millis(1500), "1.50s")]
    #[case(Duration::from_secs(125), "2m 5s")]
    #[case(Duration::from_secs(3725), "1h 2m 5s")]
    fn test_format_duration(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(duration), expected);
    }
}
