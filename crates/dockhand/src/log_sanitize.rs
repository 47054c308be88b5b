const MAX_LOG_CHARS: usize = 4096;
pub const REDACTED: &str = "***";

enum EscapeMode {
    Esc,
    Csi,
    // OSC ends on BEL or ST; DCS/SOS/PM/APC only on ST.
    String { bel_ends: bool },
    StringEsc { bel_ends: bool },
}

/// Replace every occurrence of a registered secret with `***`.
pub fn redact(input: &str, secrets: &[String]) -> String {
    let mut out = input.to_string();
    for secret in secrets {
        if secret.is_empty() || !out.contains(secret.as_str()) {
            continue;
        }
        out = out.replace(secret.as_str(), REDACTED);
    }
    out
}

/// Make one line of child-process output safe for the console and the run log.
/// Secrets are redacted before escape sequences are stripped and the line is
/// truncated.
pub fn sanitize_log_line(input: &str, secrets: &[String]) -> String {
    let input = redact(input, secrets);
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut esc_mode: Option<EscapeMode> = None;
    let mut char_count = 0usize;

    for c in input.chars() {
        if let Some(mode) = esc_mode.take() {
            esc_mode = match mode {
                EscapeMode::Esc => match c {
                    '[' => Some(EscapeMode::Csi),
                    ']' => Some(EscapeMode::String { bel_ends: true }),
                    'P' | 'X' | '^' | '_' => Some(EscapeMode::String { bel_ends: false }),
                    _ => None,
                },
                EscapeMode::Csi => (!('@'..='~').contains(&c)).then_some(EscapeMode::Csi),
                EscapeMode::String { bel_ends } => match c {
                    '\x07' if bel_ends => None,
                    '\x1b' => Some(EscapeMode::StringEsc { bel_ends }),
                    _ => Some(EscapeMode::String { bel_ends }),
                },
                EscapeMode::StringEsc { bel_ends } => match c {
                    '\\' => None,
                    '\x1b' => Some(EscapeMode::StringEsc { bel_ends }),
                    _ => Some(EscapeMode::String { bel_ends }),
                },
            };
            continue;
        }

        match c {
            '\x1b' => {
                esc_mode = Some(EscapeMode::Esc);
                continue;
            }
            '\r' | '\n' => continue,
            '\t' => out.push(' '),
            c if c.is_control() || is_format_control(c) => continue,
            c => out.push(c),
        }
        char_count += 1;

        if char_count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
