//! On-disk formats: JSON for network configs, snapshots, and lineage
//! records, plus a small line-oriented text format for episode sets.
//!
//! Episode files look like:
//!
//! ```text
//! # one episode per `target` header
//! target out_a
//! duration 30
//! 0 sensor_0 1.0
//! 5 sensor_1 0.5
//! ```
//!
//! Blank lines and `#` comments are ignored. Event lines are
//! `TICK UNIT_ID AMOUNT`.

use std::fs;
use std::path::Path;

use crate::episode::Episode;
use crate::error::EvoError;
use crate::evolution::LineageNode;
use crate::network::{NetworkConfig, NetworkSnapshot};

pub fn read_network_config(path: &Path) -> Result<NetworkConfig, EvoError> {
    let text = read_text(path)?;
    serde_json::from_str(&text)
        .map_err(|e| EvoError::Codec(format!("{}: {e}", path.display())))
}

pub fn write_network_config(path: &Path, cfg: &NetworkConfig) -> Result<(), EvoError> {
    let text = serde_json::to_string_pretty(cfg).map_err(|e| EvoError::Codec(e.to_string()))?;
    write_text(path, &text)
}

pub fn snapshot_to_json(snap: &NetworkSnapshot) -> Result<String, EvoError> {
    serde_json::to_string_pretty(snap).map_err(|e| EvoError::Codec(e.to_string()))
}

pub fn snapshot_from_json(text: &str) -> Result<NetworkSnapshot, EvoError> {
    serde_json::from_str(text).map_err(|e| EvoError::Codec(e.to_string()))
}

pub fn read_snapshot(path: &Path) -> Result<NetworkSnapshot, EvoError> {
    let text = read_text(path)?;
    serde_json::from_str(&text)
        .map_err(|e| EvoError::Codec(format!("{}: {e}", path.display())))
}

pub fn write_snapshot(path: &Path, snap: &NetworkSnapshot) -> Result<(), EvoError> {
    write_text(path, &snapshot_to_json(snap)?)
}

pub fn lineage_to_json(nodes: &[LineageNode]) -> Result<String, EvoError> {
    serde_json::to_string_pretty(nodes).map_err(|e| EvoError::Codec(e.to_string()))
}

pub fn write_lineage(path: &Path, nodes: &[LineageNode]) -> Result<(), EvoError> {
    write_text(path, &lineage_to_json(nodes)?)
}

pub fn read_episodes(path: &Path) -> Result<Vec<Episode>, EvoError> {
    parse_episodes(&read_text(path)?)
}

/// Parse an episode-set text. Each `target` header opens a new episode.
pub fn parse_episodes(text: &str) -> Result<Vec<Episode>, EvoError> {
    let mut episodes = Vec::new();
    let mut current: Option<Episode> = None;

    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let head = parts.next().unwrap_or_default();

        match head {
            "target" => {
                let id = parts
                    .next()
                    .ok_or_else(|| line_err(lineno, "`target` needs a unit id"))?;
                if let Some(ep) = current.take() {
                    episodes.push(ep);
                }
                current = Some(Episode::new(id, 0));
            }
            "duration" => {
                let n: usize = parts
                    .next()
                    .ok_or_else(|| line_err(lineno, "`duration` needs a tick count"))?
                    .parse()
                    .map_err(|_| line_err(lineno, "`duration` is not a number"))?;
                current
                    .as_mut()
                    .ok_or_else(|| line_err(lineno, "`duration` before any `target`"))?
                    .set_len(n);
            }
            _ => {
                let tick: usize = head
                    .parse()
                    .map_err(|_| line_err(lineno, "expected `target`, `duration`, or a tick"))?;
                let id = parts
                    .next()
                    .ok_or_else(|| line_err(lineno, "event line needs a unit id"))?;
                let amount: f32 = parts
                    .next()
                    .ok_or_else(|| line_err(lineno, "event line needs an amount"))?
                    .parse()
                    .map_err(|_| line_err(lineno, "event amount is not a number"))?;
                current
                    .as_mut()
                    .ok_or_else(|| line_err(lineno, "event before any `target`"))?
                    .push_event(tick, id, amount)?;
            }
        }
        if parts.next().is_some() {
            return Err(line_err(lineno, "trailing tokens"));
        }
    }

    if let Some(ep) = current {
        episodes.push(ep);
    }
    Ok(episodes)
}

fn line_err(lineno: usize, what: &str) -> EvoError {
    EvoError::Codec(format!("line {lineno}: {what}"))
}

fn read_text(path: &Path) -> Result<String, EvoError> {
    fs::read_to_string(path).map_err(|e| EvoError::Codec(format!("{}: {e}", path.display())))
}

fn write_text(path: &Path, text: &str) -> Result<(), EvoError> {
    fs::write(path, text).map_err(|e| EvoError::Codec(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Network, ResetPolicy};

    #[test]
    fn episode_text_parses_headers_and_events() {
        let text = "\
# two trials
target out_a
duration 30
0 s0 1.0
5 s1 0.5

target out_b
2 s1 1.0
";
        let eps = parse_episodes(text).unwrap();
        assert_eq!(eps.len(), 2);

        assert_eq!(eps[0].target(), "out_a");
        assert_eq!(eps[0].len(), 30);
        assert_eq!(eps[0].events_at(0), &[("s0".to_string(), 1.0)]);
        assert_eq!(eps[0].events_at(5), &[("s1".to_string(), 0.5)]);

        assert_eq!(eps[1].target(), "out_b");
        assert_eq!(eps[1].len(), 3);
        assert_eq!(eps[1].events_at(2), &[("s1".to_string(), 1.0)]);
    }

    #[test]
    fn episode_text_rejects_malformed_lines() {
        assert!(parse_episodes("0 s0 1.0\n").is_err(), "event before target");
        assert!(parse_episodes("target\n").is_err(), "missing target id");
        assert!(parse_episodes("target a\nbogus s0 1.0\n").is_err());
        assert!(parse_episodes("target a\n0 s0 nan_nope\n").is_err());
        assert!(parse_episodes("target a\n0 s0 1.0 extra\n").is_err());
    }

    #[test]
    fn snapshot_json_roundtrip() {
        let mut net = Network::new(ResetPolicy::Zero);
        net.add_unit("a", 0.5, 0.9, 0.0).unwrap();
        net.add_unit("b", 0.7, 0.8, 0.0).unwrap();
        net.add_connection("a", "b", -0.25).unwrap();
        let snap = net.capture();

        let json = snapshot_to_json(&snap).unwrap();
        let back = snapshot_from_json(&json).unwrap();
        assert_eq!(back.neurons.len(), 2);
        assert_eq!(back.edges.len(), 1);
        assert_eq!(back.edges[0].from, "a");
        assert_eq!(back.edges[0].weight, -0.25);
    }

    #[test]
    fn bad_snapshot_json_is_a_codec_error() {
        assert!(matches!(
            snapshot_from_json("{ not json"),
            Err(EvoError::Codec(_))
        ));
    }
}
