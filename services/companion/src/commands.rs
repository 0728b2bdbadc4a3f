//! Parsing of the lines typed at the companion prompt.

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Plain text, sent to the tutor as a turn.
    Say(String),
    Mute,
    Unmute,
    Speaker(bool),
    Rate(f32),
    Pitch(f32),
    Volume(f32),
    Voice(String),
    Voices,
    History,
    Help,
    Quit,
    /// A slash command that could not be understood, with a hint for the user.
    Invalid(String),
}

pub const HELP: &str = "\
Type a message and press Enter to talk to your tutor.
  /mute, /unmute         pause or resume the microphone
  /speaker off|on        silence or restore the tutor's voice
  /rate R                speaking rate (0.1-10)
  /pitch P               voice pitch (0-2)
  /volume V              voice volume (0-1)
  /voice NAME            choose a voice (see /voices)
  /voices                list available voices
  /history               show the conversation so far
  /quit                  end the session";

impl ConsoleCommand {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(ConsoleCommand::Say(line.to_string()));
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };
        let parsed = match (name.to_lowercase().as_str(), argument) {
            ("mute", "") => ConsoleCommand::Mute,
            ("unmute", "") => ConsoleCommand::Unmute,
            ("speaker", "off") => ConsoleCommand::Speaker(false),
            ("speaker", "on") => ConsoleCommand::Speaker(true),
            ("speaker", _) => ConsoleCommand::Invalid("usage: /speaker off|on".to_string()),
            ("rate", value) => number(value, "rate", ConsoleCommand::Rate),
            ("pitch", value) => number(value, "pitch", ConsoleCommand::Pitch),
            ("volume", value) => number(value, "volume", ConsoleCommand::Volume),
            ("voice", "") => ConsoleCommand::Invalid("usage: /voice NAME".to_string()),
            ("voice", name) => ConsoleCommand::Voice(name.to_string()),
            ("voices", "") => ConsoleCommand::Voices,
            ("history", "") => ConsoleCommand::History,
            ("help", "") => ConsoleCommand::Help,
            ("quit" | "exit", "") => ConsoleCommand::Quit,
            _ => ConsoleCommand::Invalid(format!("unknown command: /{command} (try /help)")),
        };
        Some(parsed)
    }
}

fn number(value: &str, name: &str, build: fn(f32) -> ConsoleCommand) -> ConsoleCommand {
    match value.parse::<f32>() {
        Ok(number) if number.is_finite() => build(number),
        _ => ConsoleCommand::Invalid(format!("usage: /{name} NUMBER")),
    }
}
