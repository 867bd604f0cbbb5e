//! Character and key-code tables
//!
//! Key codes follow the Android `KeyEvent` numbering used by the `input`
//! command and by the `input.key` control message.

pub const KEYCODE_HOME: i32 = 3;
pub const KEYCODE_BACK: i32 = 4;
pub const KEYCODE_0: i32 = 7;
pub const KEYCODE_DPAD_UP: i32 = 19;
pub const KEYCODE_DPAD_DOWN: i32 = 20;
pub const KEYCODE_DPAD_LEFT: i32 = 21;
pub const KEYCODE_DPAD_RIGHT: i32 = 22;
pub const KEYCODE_A: i32 = 29;
pub const KEYCODE_TAB: i32 = 61;
pub const KEYCODE_SPACE: i32 = 62;
pub const KEYCODE_ENTER: i32 = 66;
pub const KEYCODE_DEL: i32 = 67;
pub const KEYCODE_ESCAPE: i32 = 111;
pub const KEYCODE_FORWARD_DEL: i32 = 112;
pub const KEYCODE_APP_SWITCH: i32 = 187;
pub const KEYCODE_PASTE: i32 = 279;

/// One key press, optionally with Shift held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStroke {
    pub code: i32,
    pub shift: bool,
}

impl KeyStroke {
    const fn plain(code: i32) -> Self {
        Self { code, shift: false }
    }

    const fn shifted(code: i32) -> Self {
        Self { code, shift: true }
    }
}

/// Unshifted punctuation and whitespace on their own keys
const BASE_KEYS: &[(char, i32)] = &[
    (' ', KEYCODE_SPACE),
    ('\n', KEYCODE_ENTER),
    ('\t', KEYCODE_TAB),
    ('`', 68),
    ('-', 69),
    ('=', 70),
    ('[', 71),
    (']', 72),
    ('\\', 73),
    (';', 74),
    ('\'', 75),
    ('/', 76),
    (',', 55),
    ('.', 56),
];

/// Shifted symbols and the base character of their key
const SHIFTED_KEYS: &[(char, char)] = &[
    ('~', '`'),
    ('!', '1'),
    ('@', '2'),
    ('#', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
    ('_', '-'),
    ('+', '='),
    ('{', '['),
    ('}', ']'),
    ('|', '\\'),
    (':', ';'),
    ('"', '\''),
    ('<', ','),
    ('>', '.'),
    ('?', '/'),
];

/// Key code for a character on a US layout
pub fn lookup(c: char) -> Option<KeyStroke> {
    match c {
        'a'..='z' => Some(KeyStroke::plain(KEYCODE_A + (c as i32 - 'a' as i32))),
        'A'..='Z' => Some(KeyStroke::shifted(KEYCODE_A + (c as i32 - 'A' as i32))),
        '0'..='9' => Some(KeyStroke::plain(KEYCODE_0 + (c as i32 - '0' as i32))),
        _ => {
            if let Some((_, code)) = BASE_KEYS.iter().find(|(ch, _)| *ch == c) {
                return Some(KeyStroke::plain(*code));
            }
            let (_, base) = SHIFTED_KEYS.iter().find(|(ch, _)| *ch == c)?;
            lookup(*base).map(|stroke| KeyStroke::shifted(stroke.code))
        }
    }
}

/// Unshifted character produced by a key code, if it has one
pub fn base_char(code: i32) -> Option<char> {
    match code {
        c if (KEYCODE_A..KEYCODE_A + 26).contains(&c) => char::from_u32('a' as u32 + (c - KEYCODE_A) as u32),
        c if (KEYCODE_0..KEYCODE_0 + 10).contains(&c) => char::from_u32('0' as u32 + (c - KEYCODE_0) as u32),
        _ => BASE_KEYS.iter().find(|(_, k)| *k == code).map(|(ch, _)| *ch),
    }
}

/// Whether `c` needs Shift on a US layout
pub fn needs_shift(c: char) -> bool {
    c.is_ascii_uppercase() || SHIFTED_KEYS.iter().any(|(ch, _)| *ch == c)
}

/// Quote text for `input text '<...>'`
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('\'');
    for c in text.chars() {
        match c {
            '\'' => escaped.push_str("'\\''"),
            ' ' => escaped.push_str("%s"),
            c => escaped.push(c),
        }
    }
    escaped.push('\'');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_and_digits() {
        assert_eq!(lookup('a'), Some(KeyStroke::plain(29)));
        assert_eq!(lookup('z'), Some(KeyStroke::plain(54)));
        assert_eq!(lookup('A'), Some(KeyStroke::shifted(29)));
        assert_eq!(lookup('0'), Some(KeyStroke::plain(7)));
        assert_eq!(lookup('9'), Some(KeyStroke::plain(16)));
    }

    #[test]
    fn symbols_share_keys_with_their_base() {
        assert_eq!(lookup('.'), Some(KeyStroke::plain(56)));
        assert_eq!(lookup('>'), Some(KeyStroke::shifted(56)));
        assert_eq!(lookup('_'), Some(KeyStroke::shifted(69)));
        assert_eq!(lookup('!'), Some(KeyStroke::shifted(8)));
        assert_eq!(lookup(')'), Some(KeyStroke::shifted(7)));
        assert_eq!(lookup('~'), Some(KeyStroke::shifted(68)));
        assert_eq!(lookup('\n'), Some(KeyStroke::plain(KEYCODE_ENTER)));
        assert_eq!(lookup('é'), None);
    }

    #[test]
    fn base_char_inverts_plain_keys() {
        assert_eq!(base_char(29), Some('a'));
        assert_eq!(base_char(16), Some('9'));
        assert_eq!(base_char(76), Some('/'));
        assert_eq!(base_char(KEYCODE_HOME), None);
        assert!(needs_shift('Q'));
        assert!(needs_shift('?'));
        assert!(!needs_shift('q'));
    }

    #[test]
    fn escaping_for_input_text() {
        assert_eq!(escape_text("hi there"), "'hi%sthere'");
        assert_eq!(escape_text("it's"), "'it'\\''s'");
        assert_eq!(escape_text(""), "''");
    }
}
