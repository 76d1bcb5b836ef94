use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::job::ScriptSegment;

/// One timed caption. `start_time` is inclusive, `end_time` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionEntry {
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
}

impl CaptionEntry {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Splits this caption into display lines of at most `width` chars,
    /// dividing the time window evenly between them. The last line always
    /// ends exactly at `end_time`.
    pub fn display_lines(&self, width: usize) -> Vec<CaptionEntry> {
        split_window(&self.text, self.start_time, self.end_time, width)
    }
}

/// Walks the segments in order, giving segment `i` the window
/// `[t, t + durations[i])` where `t` is the end of the previous one.
pub fn build_captions(
    segments: &[ScriptSegment],
    durations: &[f64],
) -> PipelineResult<Vec<CaptionEntry>> {
    if segments.len() != durations.len() {
        return Err(PipelineError::InvalidJob(format!(
            "{} segments but {} measured durations",
            segments.len(),
            durations.len()
        )));
    }

    let mut entries = Vec::with_capacity(segments.len());
    let mut current_time = 0.0_f64;
    for (segment, &dur) in segments.iter().zip(durations) {
        let start_time = current_time;
        let end_time = current_time + dur;
        entries.push(CaptionEntry {
            text: collapse_whitespace(&segment.text),
            start_time,
            end_time,
        });
        current_time = end_time;
    }
    Ok(entries)
}

pub fn split_window(text: &str, start: f64, end: f64, width: usize) -> Vec<CaptionEntry> {
    let lines = wrap_text(text, width);
    if lines.is_empty() {
        return Vec::new();
    }

    let step = (end - start) / lines.len() as f64;
    let count = lines.len();
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| CaptionEntry {
            text: line,
            start_time: start + step * i as f64,
            end_time: if i + 1 == count {
                end
            } else {
                start + step * (i + 1) as f64
            },
        })
        .collect()
}

pub fn write_srt(path: &Path, entries: &[CaptionEntry], width: usize) -> PipelineResult<()> {
    let mut f = File::create(path)?;
    for (i, entry) in entries.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(
            f,
            "{} --> {}",
            format_srt_time(entry.start_time),
            format_srt_time(entry.end_time)
        )?;
        for line in wrap_text(&entry.text, width) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

pub fn write_captions_json(path: &Path, entries: &[CaptionEntry]) -> PipelineResult<()> {
    let data = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, data)?;
    Ok(())
}

pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

/// Greedy word wrap. A single word longer than `width` gets its own line.
pub fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        let projected = current.chars().count() + word.chars().count() + 1;
        if projected > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(texts: &[&str]) -> Vec<ScriptSegment> {
        texts
            .iter()
            .map(|t| ScriptSegment {
                text: t.to_string(),
                image_prompt: String::new(),
                planned_duration: 10.0,
            })
            .collect()
    }

    #[test]
    fn captions_follow_measured_durations() {
        let segs = segments(&["One.", "Two.", "Three."]);
        let entries = build_captions(&segs, &[9.2, 11.0, 9.8]).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].start_time, 0.0);
        assert!((entries[0].end_time - 9.2).abs() < 1e-9);
        assert!((entries[1].end_time - 20.2).abs() < 1e-9);
        assert!((entries[2].end_time - 30.0).abs() < 1e-9);
    }

    #[test]
    fn captions_are_contiguous() {
        let durations = [0.37, 4.123, 2.0, 7.77, 0.001, 3.3333];
        let segs = segments(&["a", "b", "c", "d", "e", "f"]);
        let entries = build_captions(&segs, &durations).unwrap();

        for pair in entries.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
        let total: f64 = durations.iter().sum();
        assert!((entries.last().unwrap().end_time - total).abs() < 1e-6);
    }

    #[test]
    fn empty_input_gives_no_captions() {
        assert!(build_captions(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let segs = segments(&["a", "b"]);
        assert!(build_captions(&segs, &[1.0]).is_err());
    }

    #[test]
    fn display_lines_share_the_window() {
        let entry = CaptionEntry {
            text: "the quick brown fox jumps over the lazy dog".into(),
            start_time: 10.0,
            end_time: 13.0,
        };
        let lines = entry.display_lines(20);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].start_time, 10.0);
        assert!((lines[1].start_time - 11.0).abs() < 1e-9);
        assert_eq!(lines[2].end_time, 13.0);
        for pair in lines.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
        assert!(lines.iter().all(|l| l.text.chars().count() <= 20));
    }

    #[test]
    fn srt_time_format() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(20.2), "00:00:20,200");
        assert_eq!(format_srt_time(3723.456), "01:02:03,456");
    }

    #[test]
    fn srt_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.srt");
        let entries = vec![
            CaptionEntry {
                text: "Hello there".into(),
                start_time: 0.0,
                end_time: 1.5,
            },
            CaptionEntry {
                text: "General Kenobi".into(),
                start_time: 1.5,
                end_time: 3.0,
            },
        ];
        write_srt(&path, &entries, 56).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "1\n00:00:00,000 --> 00:00:01,500\nHello there\n\n2\n00:00:01,500 --> 00:00:03,000\nGeneral Kenobi\n\n"
        );
    }
}
