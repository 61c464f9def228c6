use std::io::Read;
use std::sync::mpsc;

const MAX_LINE_CHARS: usize = 4096;
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// Split a child stream into lines and forward them until EOF.
pub(crate) fn forward_lines<R: Read>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::with_capacity(512);

    let flush = |pending: &mut Vec<u8>, tx: &mpsc::Sender<String>| {
        if pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let _ = tx.send(line);
    };

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            match b {
                b'\n' | b'\r' => flush(&mut pending, &tx),
                _ => {
                    pending.push(b);
                    if pending.len() >= MAX_PENDING_BYTES {
                        flush(&mut pending, &tx);
                    }
                }
            }
        }
    }
    flush(&mut pending, &tx);
}

/// Strip terminal escape sequences and control characters so tool output is
/// safe to echo and to store in error logs.
pub fn clean_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut chars = input.chars().peekable();
    let mut kept = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters up to a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC / DCS / PM / APC: terminated by BEL or ESC '\'.
                Some(']' | 'P' | 'X' | '^' | '_') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        let mapped = match c {
            '\t' => ' ',
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };
        out.push(mapped);
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_color_codes_and_titles() {
        let got = clean_line("Wrote \u{1b}[32msea-prep.blob\u{1b}[0m\u{1b}]0;node\u{7}!");
        assert_eq!(got, "Wrote sea-prep.blob!");
    }

    #[test]
    fn drops_controls_and_maps_tabs() {
        assert_eq!(clean_line("a\tb\u{0}c\u{202e}d"), "a bcd");
    }

    #[test]
    fn splits_on_cr_and_lf() {
        let (tx, rx) = mpsc::channel();
        forward_lines(&b"one\r\ntwo\n\nthree"[..], tx);
        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }
}
