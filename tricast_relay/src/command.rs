// Chat line commands for the `chat` binary.
//
// A line typed by the operator picks a channel with an optional leading
// command: "/t text" reliable, "/u text" unicast, "/m text" group. A line
// without a leading '/' goes out reliably. Command letters are
// case-insensitive.

/// What the operator asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Reliable(String),
    Unicast(String),
    Group(String),
    /// An unrecognized "/x" command; holds "x".
    Invalid(String),
}

/// Parse one input line. Empty lines yield `None`.
pub fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Reliable(line.to_owned()));
    };
    let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let message = message.to_owned();
    let command = match name.to_lowercase().as_str() {
        "t" => Command::Reliable(message),
        "u" => Command::Unicast(message),
        "m" => Command::Group(message),
        _ => Command::Invalid(name.to_owned()),
    };
    Some(command)
}
