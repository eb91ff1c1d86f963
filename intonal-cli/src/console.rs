//! Line commands typed at the console, and how engine feedback is printed.

use intonal_core::engine::EngineFeedback;
use intonal_core::protocol::BackendKind;
use intonal_types::{Sensitivity, Tonality};

pub const HELP: &str = "\
commands:
  start | stop | panic
  sens low|medium|high      key detection sensitivity
  key <name>|auto           manual key (e.g. 'key Eb', 'key f#m'), or back to detection
  backend <name>|auto       force fine_sysex or channel_rotation, or negotiate
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Panic,
    Sensitivity(Sensitivity),
    Key(Option<Tonality>),
    Backend(Option<BackendKind>),
    Help,
    Quit,
}

/// `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let arg = rest.join(" ");

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "stop" => Command::Stop,
        "panic" => Command::Panic,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        "sens" | "sensitivity" => Command::Sensitivity(
            Sensitivity::parse(&arg).ok_or_else(|| format!("unknown sensitivity {:?}", arg))?,
        ),
        "key" => match arg.as_str() {
            "" => return Err("key needs a name or 'auto'".into()),
            "auto" => Command::Key(None),
            name => Command::Key(Some(
                Tonality::parse(name).ok_or_else(|| format!("unknown key {:?}", name))?,
            )),
        },
        "backend" => match arg.as_str() {
            "" => return Err("backend needs a name or 'auto'".into()),
            "auto" => Command::Backend(None),
            name => match BackendKind::parse(name) {
                Some(BackendKind::HighResFormat) => {
                    return Err(format!("{} is only available for export", BackendKind::HighResFormat))
                }
                Some(kind) => Command::Backend(Some(kind)),
                None => return Err(format!("unknown backend {:?}", name)),
            },
        },
        other => return Err(format!("unknown command {:?} (try 'help')", other)),
    };
    Ok(Some(cmd))
}

/// One status line per feedback message; tick statistics only when asked.
pub fn describe(feedback: &EngineFeedback, with_stats: bool) -> Option<String> {
    let text = match feedback {
        EngineFeedback::KeyChanged {
            key: Some(key),
            source,
            confidence,
        } => {
            let source = source.map(|s| s.to_string()).unwrap_or_default();
            match confidence {
                Some(c) => format!("key: {} ({}, {:.0}%)", key, source, c),
                None => format!("key: {} ({})", key, source),
            }
        }
        EngineFeedback::KeyChanged { key: None, .. } => "key: none (equal temperament)".to_string(),
        EngineFeedback::ModeChanged(kind) => format!("backend: {}", kind),
        EngineFeedback::NoteDropped { pitch, reason } => format!("note {} dropped: {}", pitch, reason),
        EngineFeedback::Degraded { pitch, reason } => format!("note {}: {}", pitch, reason),
        EngineFeedback::Stopped => "engine stopped".to_string(),
        EngineFeedback::TickStats {
            avg_us,
            max_us,
            p95_us,
            overruns,
        } => {
            if !with_stats && *overruns == 0 {
                return None;
            }
            format!(
                "tick: avg {} us, p95 {} us, max {} us, {} overruns",
                avg_us, p95_us, max_us, overruns
            )
        }
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use intonal_core::engine::{Degradation, KeySource};

    #[test]
    fn parses_commands() {
        assert_eq!(parse("   "), Ok(None));
        assert_eq!(parse("panic"), Ok(Some(Command::Panic)));
        assert_eq!(
            parse("sens high"),
            Ok(Some(Command::Sensitivity(Sensitivity::High)))
        );
        assert_eq!(parse("key F# minor"), Ok(Some(Command::Key(Tonality::parse("F#m")))));
        assert_eq!(parse("key auto"), Ok(Some(Command::Key(None))));
        assert_eq!(
            parse("backend mpe"),
            Ok(Some(Command::Backend(Some(BackendKind::ChannelRotation))))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("key H").is_err());
        assert!(parse("key").is_err());
        assert!(parse("backend high_res").is_err());
        assert!(parse("tune").is_err());
    }

    #[test]
    fn describes_feedback() {
        let key = EngineFeedback::KeyChanged {
            key: Some(Tonality::C_MAJOR),
            source: Some(KeySource::Detected),
            confidence: Some(72.4),
        };
        assert_eq!(describe(&key, false).as_deref(), Some("key: C major (detected, 72%)"));

        let dropped = EngineFeedback::NoteDropped {
            pitch: 61,
            reason: Degradation::Stolen,
        };
        assert_eq!(describe(&dropped, false).as_deref(), Some("note 61 dropped: channel stolen"));

        let quiet = EngineFeedback::TickStats {
            avg_us: 40,
            max_us: 90,
            p95_us: 70,
            overruns: 0,
        };
        assert_eq!(describe(&quiet, false), None);
        assert!(describe(&quiet, true).is_some());
    }
}
