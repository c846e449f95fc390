//! Progress bars for outgoing and incoming files

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use lanshare_core::TransferProgressEvent;
use lanshare_discovery::DeviceId;
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

const BAR_TEMPLATE: &str = concat!(
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] ",
    "{bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
);

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Bar for one file
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Standalone bar of `total_bytes`
    #[must_use]
    pub fn new(total_bytes: u64, label: &str) -> Self {
        Self::styled(ProgressBar::new(total_bytes), label)
    }

    fn styled(bar: ProgressBar, label: &str) -> Self {
        bar.set_style(bar_style());
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Move to `bytes` transferred
    pub fn update(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    /// Stop and leave `msg` in place of the label
    pub fn finish_with_message(&self, msg: impl Into<Cow<'static, str>>) {
        self.bar.finish_with_message(msg);
    }

    /// Stop where it is
    pub fn abandon(&self) {
        self.bar.abandon();
    }

    #[cfg(test)]
    fn position(&self) -> u64 {
        self.bar.position()
    }
}

/// Bars for concurrent incoming files, keyed by sender and file name
pub struct ReceiveBoard {
    multi: MultiProgress,
    bars: HashMap<(DeviceId, String), TransferProgress>,
}

impl ReceiveBoard {
    /// Board drawing to the terminal
    #[must_use]
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
        }
    }

    /// Apply a receive progress event, creating the bar on first sight
    pub fn update(&mut self, event: &TransferProgressEvent) {
        let key = (event.remote.clone(), event.file_name.clone());
        let multi = &self.multi;
        let bar = self.bars.entry(key).or_insert_with(|| {
            TransferProgress::styled(
                multi.add(ProgressBar::new(event.total_size)),
                &format!("Receiving: {} from {}", event.file_name, event.remote.short()),
            )
        });
        bar.update(event.bytes);
    }

    /// Close the bar of a delivered file
    ///
    /// Zero-byte files never get a bar; nothing happens then.
    pub fn finish(&mut self, from: &DeviceId, file_name: &str, msg: String) {
        if let Some(bar) = self.bars.remove(&(from.clone(), file_name.to_string())) {
            bar.finish_with_message(msg);
        }
    }

    /// Abandon every bar for files coming from `from`
    pub fn abandon_from(&mut self, from: &DeviceId) {
        self.bars.retain(|(sender, _), bar| {
            if sender == from {
                bar.abandon();
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.bars.len()
    }
}

impl Default for ReceiveBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte count with binary prefixes: `512 B`, `39.06 KiB`
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let exp = ((63 - bytes.leading_zeros()) / 10).min(4) as usize;
    let scaled = bytes as f64 / (1u64 << (10 * exp)) as f64;
    format!("{scaled:.2} {}", UNITS[exp])
}

/// Throughput, `-` when unknown
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
        format!("{}/s", format_bytes(bytes_per_sec as u64))
    } else {
        "-".to_string()
    }
}

/// Elapsed time: tenths below a minute, then `1m 05s`, `2h 03m`
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..60 => format!("{:.1}s", duration.as_secs_f64()),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::TransferDirection;

    fn event(remote: &str, file: &str, bytes: u64) -> TransferProgressEvent {
        TransferProgressEvent {
            remote: DeviceId::from(remote),
            direction: TransferDirection::Receive,
            file_name: file.to_string(),
            total_size: 40000,
            bytes,
            progress: bytes as f64 / 40000.0,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(40000), "39.06 KiB");
        assert_eq!(format_bytes(4 * 1024 * 1024 * 1024), "4.00 GiB");
        assert_eq!(format_bytes(u64::MAX), "16777216.00 TiB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(16384.0), "16.00 KiB/s");
        assert_eq!(format_speed(0.0), "-");
        assert_eq!(format_speed(f64::NAN), "-");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_duration(Duration::from_secs(7380)), "2h 03m");
    }

    #[test]
    fn test_board_tracks_files_per_sender() {
        let mut board = ReceiveBoard::with_target(ProgressDrawTarget::hidden());

        board.update(&event("alice", "a.txt", 16384));
        board.update(&event("alice", "a.txt", 32768));
        board.update(&event("bob", "a.txt", 16384));
        assert_eq!(board.active(), 2);

        let key = (DeviceId::from("alice"), "a.txt".to_string());
        assert_eq!(board.bars[&key].position(), 32768);

        board.finish(&DeviceId::from("alice"), "a.txt", "done".to_string());
        assert_eq!(board.active(), 1);

        board.abandon_from(&DeviceId::from("bob"));
        assert_eq!(board.active(), 0);

        // Unknown files are ignored
        board.finish(&DeviceId::from("carol"), "x", "done".to_string());
    }
}
