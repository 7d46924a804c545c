// src/connection/message.rs - Classification of lines received from the firmware
use std::collections::BTreeMap;
use std::fmt;

/// One classified line from the printer.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterMessage {
    /// `ok [line] [KEY:VALUE ...]`
    Confirmation { line: Option<u16>, params: BTreeMap<String, String> },
    /// `Error:<code>`, optionally naming a line.
    Error { line: Option<u16>, code: i32 },
    /// `rs <line>` or `Resend: <line>`
    ResendRequest { line: u16 },
    /// `skip <line>`: the firmware dropped the line without executing it.
    Skip { line: Option<u16> },
    /// `T:<temperature>`
    TemperatureUpdate { temperature: f64 },
    /// Anything else, kept for diagnostics.
    Unknown(String),
}

impl PrinterMessage {
    /// Classify one line. Never fails; unrecognised text becomes `Unknown`.
    pub fn classify(raw: &str) -> Self {
        let text = raw.trim();
        let unknown = || PrinterMessage::Unknown(text.to_string());

        if let Some(rest) = strip_prefix_ignore_case(text, "ok") {
            if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
                return unknown();
            }
            return classify_confirmation(rest.trim_start());
        }
        if let Some(rest) = strip_prefix_ignore_case(text, "error:") {
            return match parse_error(rest.trim_start()) {
                Some((code, line)) => PrinterMessage::Error { line, code },
                None => unknown(),
            };
        }
        if let Some(rest) =
            strip_prefix_ignore_case(text, "resend:").map(str::trim_start).or_else(|| strip_word(text, "rs"))
        {
            return match parse_line_number(rest) {
                Some(line) => PrinterMessage::ResendRequest { line },
                None => unknown(),
            };
        }
        if let Some(rest) = strip_word(text, "skip") {
            return PrinterMessage::Skip { line: parse_line_number(rest) };
        }
        if let Some(rest) = text.strip_prefix("T:") {
            let value = rest.split_whitespace().next().unwrap_or("");
            return match value.parse() {
                Ok(temperature) => PrinterMessage::TemperatureUpdate { temperature },
                Err(_) => unknown(),
            };
        }
        unknown()
    }

    /// Line number this message refers to, if any.
    pub fn line(&self) -> Option<u16> {
        match self {
            PrinterMessage::Confirmation { line, .. }
            | PrinterMessage::Error { line, .. }
            | PrinterMessage::Skip { line } => *line,
            PrinterMessage::ResendRequest { line } => Some(*line),
            _ => None,
        }
    }

    /// Temperature carried by a report or a confirmation's `T:` parameter.
    pub fn temperature(&self) -> Option<f64> {
        match self {
            PrinterMessage::TemperatureUpdate { temperature } => Some(*temperature),
            PrinterMessage::Confirmation { params, .. } => params.get("T")?.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for PrinterMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterMessage::Confirmation { line, params } => {
                write!(f, "ok")?;
                if let Some(line) = line {
                    write!(f, " {}", line)?;
                }
                for (key, value) in params {
                    write!(f, " {}:{}", key, value)?;
                }
                Ok(())
            }
            PrinterMessage::Error { line: Some(line), code } => write!(f, "Error:{} N{}", code, line),
            PrinterMessage::Error { line: None, code } => write!(f, "Error:{}", code),
            PrinterMessage::ResendRequest { line } => write!(f, "rs {}", line),
            PrinterMessage::Skip { line: Some(line) } => write!(f, "skip {}", line),
            PrinterMessage::Skip { line: None } => write!(f, "skip"),
            PrinterMessage::TemperatureUpdate { temperature } => write!(f, "T:{}", temperature),
            PrinterMessage::Unknown(text) => f.write_str(text),
        }
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

/// Strip `word` only when it stands alone (followed by whitespace or the end).
fn strip_word<'a>(text: &'a str, word: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(word)?;
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then(|| rest.trim_start())
}

fn parse_line_number(text: &str) -> Option<u16> {
    let token = text.split_whitespace().next()?;
    let digits = token.trim_start_matches(['N', 'n']);
    digits.parse().ok()
}

fn classify_confirmation(rest: &str) -> PrinterMessage {
    let mut line = None;
    let mut params = BTreeMap::new();
    for (i, token) in rest.split_whitespace().enumerate() {
        if let Some((key, value)) = token.split_once(':') {
            params.insert(key.to_string(), value.to_string());
        } else if i == 0 {
            line = token.trim_start_matches(['N', 'n']).parse().ok();
        }
    }
    PrinterMessage::Confirmation { line, params }
}

fn parse_error(rest: &str) -> Option<(i32, Option<u16>)> {
    let mut tokens = rest.split_whitespace();
    let code = tokens.next()?.parse().ok()?;
    let line = tokens.next().and_then(parse_line_number);
    Some((code, line))
}
