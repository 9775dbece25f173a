const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
}

/// Strip ANSI escape sequences and control characters from one line of tool
/// output, capping its length so a runaway tool cannot flood the log.
pub fn sanitize_tool_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Osc),
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Osc, '\x07') => None,
                (Escape::Osc, '\x1b') => Some(Escape::OscEsc),
                (Escape::Osc, _) => Some(Escape::Osc),
                (Escape::OscEsc, '\\') => None,
                (Escape::OscEsc, _) => Some(Escape::Osc),
            };
            continue;
        }

        match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\t' => out.push(' '),
            c if c.is_control() => continue,
            c => out.push(c),
        }
        kept += 1;

        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}
