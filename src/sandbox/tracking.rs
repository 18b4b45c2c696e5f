//! Statement line tracking for engines that do not report error locations.
//!
//! [`track_lines`] prefixes lines that begin a statement with a call to a
//! tracker function, `tracker(N);`, where `N` is the line's number in the
//! wrapped program. Lines are never added or removed, so every other location
//! in the program is unchanged.
//!
//! The scan is lexical. A line is only marked when the code before it ends a
//! statement and the line itself starts with a word that cannot continue the
//! previous expression. Anything ambiguous is left alone.

/// Words after which a line break does not end the statement.
const OPEN_AFTER: &[&str] = &[
    "async", "await", "case", "class", "const", "delete", "do", "else", "extends", "function",
    "in", "instanceof", "let", "new", "of", "return", "throw", "typeof", "var", "void", "yield",
];

/// Words that continue the statement on the previous line.
const CONTINUES: &[&str] = &[
    "as", "case", "catch", "default", "else", "extends", "finally", "in", "instanceof", "of",
    "while",
];

/// Words whose parenthesized head is followed by a statement.
const HEADED: &[&str] = &["catch", "for", "if", "while", "with"];

/// Words that may directly precede a block statement's `{`.
const BLOCK_WORDS: &[&str] = &["do", "else", "finally", "try"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    /// Braces holding statements
    Block,
    /// Object literals, class bodies, destructuring patterns
    Braces,
    Paren { headed: bool },
    Bracket,
    /// `${ ... }` inside a template literal
    Substitution,
}

/// The last significant token before the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Last {
    Start,
    /// `;`, `{` or `}`
    Terminator,
    /// Identifier, literal or `]`
    Operand,
    /// `)` of a call or parameter list
    CloseParen,
    /// `)` closing an `if`/`for`/`while`/`with`/`catch` head
    HeadEnd,
    /// A word from [`OPEN_AFTER`]
    OpenWord,
    Arrow,
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Quoted(char),
    Template,
    Regex { in_class: bool },
    LineComment,
    BlockComment,
}

struct Scanner<'a> {
    chars: &'a [char],
    pos: usize,
    mode: Mode,
    frames: Vec<Frame>,
    last: Last,
    /// Word of the last token, if it was one
    word: Option<String>,
    /// Word of the token before that, if it was one
    word_before: Option<String>,
}

impl<'a> Scanner<'a> {
    fn new(chars: &'a [char]) -> Self {
        Self {
            chars,
            pos: 0,
            mode: Mode::Code,
            frames: Vec::new(),
            last: Last::Start,
            word: None,
            word_before: None,
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn word_is(&self, candidates: &[&str]) -> bool {
        self.word
            .as_deref()
            .is_some_and(|word| candidates.contains(&word))
    }

    /// Whether the line starting at the current position begins a statement.
    fn at_statement_start(&self) -> bool {
        if self.mode != Mode::Code {
            return false;
        }
        if !matches!(self.frames.last(), None | Some(Frame::Block)) {
            return false;
        }
        if !matches!(
            self.last,
            Last::Start | Last::Terminator | Last::Operand | Last::CloseParen
        ) {
            return false;
        }

        let rest = &self.chars[self.pos..];
        let Some(start) = rest.iter().position(|c| !matches!(*c, ' ' | '\t' | '\r')) else {
            return false;
        };
        if !is_identifier_start(rest[start]) {
            return false;
        }
        let first_word: String = rest[start..]
            .iter()
            .take_while(|c| is_identifier_part(**c))
            .collect();
        !CONTINUES.contains(&first_word.as_str())
    }

    /// Record a significant token.
    fn token(&mut self, last: Last, word: Option<String>) {
        self.last = last;
        self.word_before = std::mem::replace(&mut self.word, word);
    }

    fn regex_allowed(&self) -> bool {
        !matches!(self.last, Last::Operand | Last::CloseParen)
    }

    fn brace_opens_block(&self) -> bool {
        match self.last {
            Last::Start | Last::Terminator | Last::Arrow | Last::HeadEnd | Last::CloseParen => true,
            Last::Operand | Last::OpenWord => self.word_is(BLOCK_WORDS),
            Last::Punct => false,
        }
    }

    /// Advance past one character or token.
    fn step(&mut self) {
        let Some(c) = self.peek(0) else {
            return;
        };
        match self.mode {
            Mode::Code => self.step_code(c),
            Mode::Quoted(quote) => {
                self.pos += 1;
                match c {
                    '\\' => self.pos += 1,
                    '\n' => {
                        // Unterminated; leave the line break to the code scan
                        self.pos -= 1;
                        self.mode = Mode::Code;
                    }
                    _ if c == quote => self.mode = Mode::Code,
                    _ => {}
                }
            }
            Mode::Template => {
                self.pos += 1;
                match c {
                    '\\' => self.pos += 1,
                    '`' => self.mode = Mode::Code,
                    '$' if self.peek(0) == Some('{') => {
                        self.pos += 1;
                        self.frames.push(Frame::Substitution);
                        self.mode = Mode::Code;
                        self.token(Last::Punct, None);
                    }
                    _ => {}
                }
            }
            Mode::Regex { in_class } => {
                self.pos += 1;
                match c {
                    '\\' => self.pos += 1,
                    '\n' => {
                        self.pos -= 1;
                        self.mode = Mode::Code;
                    }
                    '[' => self.mode = Mode::Regex { in_class: true },
                    ']' => self.mode = Mode::Regex { in_class: false },
                    '/' if !in_class => {
                        while self.peek(0).is_some_and(is_identifier_part) {
                            self.pos += 1;
                        }
                        self.mode = Mode::Code;
                    }
                    _ => {}
                }
            }
            Mode::LineComment => {
                if c == '\n' {
                    self.mode = Mode::Code;
                } else {
                    self.pos += 1;
                }
            }
            Mode::BlockComment => {
                self.pos += 1;
                if c == '*' && self.peek(0) == Some('/') {
                    self.pos += 1;
                    self.mode = Mode::Code;
                }
            }
        }
    }

    fn step_code(&mut self, c: char) {
        if is_identifier_start(c) {
            let word: String = self.chars[self.pos..]
                .iter()
                .take_while(|c| is_identifier_part(**c))
                .collect();
            self.pos += word.chars().count();
            let last = if OPEN_AFTER.contains(&word.as_str()) {
                Last::OpenWord
            } else {
                Last::Operand
            };
            self.token(last, Some(word));
            return;
        }
        if c.is_ascii_digit() || (c == '.' && self.peek(1).is_some_and(|n| n.is_ascii_digit())) {
            while self
                .peek(0)
                .is_some_and(|n| n.is_ascii_alphanumeric() || n == '_' || n == '.')
            {
                self.pos += 1;
            }
            self.token(Last::Operand, None);
            return;
        }

        self.pos += 1;
        match c {
            ' ' | '\t' | '\r' | '\n' => {}
            '\'' | '"' => {
                self.mode = Mode::Quoted(c);
                self.token(Last::Operand, None);
            }
            '`' => {
                self.mode = Mode::Template;
                self.token(Last::Operand, None);
            }
            '/' if self.peek(0) == Some('/') => {
                self.pos += 1;
                self.mode = Mode::LineComment;
            }
            '/' if self.peek(0) == Some('*') => {
                self.pos += 1;
                self.mode = Mode::BlockComment;
            }
            '/' if self.regex_allowed() => {
                self.mode = Mode::Regex { in_class: false };
                self.token(Last::Operand, None);
            }
            '=' if self.peek(0) == Some('>') => {
                self.pos += 1;
                self.token(Last::Arrow, None);
            }
            ';' => self.token(Last::Terminator, None),
            '{' => {
                let frame = if self.brace_opens_block() {
                    Frame::Block
                } else {
                    Frame::Braces
                };
                self.frames.push(frame);
                self.token(Last::Terminator, None);
            }
            '}' => {
                if self.frames.pop() == Some(Frame::Substitution) {
                    self.mode = Mode::Template;
                } else {
                    self.token(Last::Terminator, None);
                }
            }
            '(' => {
                let headed = (self.word_is(HEADED) && self.last == Last::Operand)
                    || (self.word.as_deref() == Some("await")
                        && self.word_before.as_deref() == Some("for"));
                self.frames.push(Frame::Paren { headed });
                self.token(Last::Punct, None);
            }
            ')' => {
                let last = match self.frames.pop() {
                    Some(Frame::Paren { headed: true }) => Last::HeadEnd,
                    _ => Last::CloseParen,
                };
                self.token(last, None);
            }
            '[' => {
                self.frames.push(Frame::Bracket);
                self.token(Last::Punct, None);
            }
            ']' => {
                self.frames.pop();
                self.token(Last::Operand, None);
            }
            _ => self.token(Last::Punct, None),
        }
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Prefix statement lines of `code` with `tracker(N);`, numbering the first
/// line of `code` as `first_line`.
pub fn track_lines(code: &str, first_line: u32, tracker: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut scanner = Scanner::new(&chars);
    let mut tracked = String::with_capacity(code.len() + code.len() / 4);
    let mut line = first_line;
    let mut at_line_start = true;

    while scanner.pos < chars.len() {
        if at_line_start && scanner.at_statement_start() {
            tracked.push_str(tracker);
            tracked.push('(');
            tracked.push_str(&line.to_string());
            tracked.push_str(");");
        }

        let from = scanner.pos;
        scanner.step();
        let to = scanner.pos.min(chars.len());
        for &c in &chars[from..to] {
            tracked.push(c);
            if c == '\n' {
                line += 1;
            }
        }
        at_line_start = to > from && chars[to - 1] == '\n';
    }

    tracked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(code: &str) -> Vec<String> {
        track_lines(code, 2, "t").lines().map(str::to_string).collect()
    }

    #[test]
    fn test_marks_statement_lines() {
        assert_eq!(
            tracked("const a = 1;\nthrow new Error('x');"),
            vec!["t(2);const a = 1;", "t(3);throw new Error('x');"]
        );
    }

    #[test]
    fn test_line_count_is_unchanged() {
        let code = "const a = `x\n${b}\ny`;\n/* c\nd */\nreturn a;\n";
        assert_eq!(track_lines(code, 2, "t").lines().count(), code.lines().count());
    }

    #[test]
    fn test_semicolon_free_statements() {
        assert_eq!(
            tracked("const a = 1\nnull.x"),
            vec!["t(2);const a = 1", "t(3);null.x"]
        );
    }

    #[test]
    fn test_continuation_lines_are_left_alone() {
        let lines = tracked("const a = items\n  .map(f)\n  .filter(g);\nconst b = a ||\n  c;\nconst d = typeof\n  e;");
        assert_eq!(lines[1], "  .map(f)");
        assert_eq!(lines[2], "  .filter(g);");
        assert_eq!(lines[3], "t(5);const b = a ||");
        assert_eq!(lines[4], "  c;");
        assert_eq!(lines[6], "  e;");
    }

    #[test]
    fn test_object_literal_and_class_bodies() {
        let lines = tracked("const o = {\n  a: 1,\n  b\n};\nclass A {\n  x = 1\n  m() {\n    return 2;\n  }\n}");
        assert_eq!(lines[1], "  a: 1,");
        assert_eq!(lines[2], "  b");
        assert_eq!(lines[3], "};");
        assert_eq!(lines[5], "  x = 1");
        assert_eq!(lines[6], "  m() {");
        assert_eq!(lines[7], "t(9);    return 2;");
    }

    #[test]
    fn test_template_and_string_contents() {
        let lines = tracked("const s = `line\nreturn 1`;\nconst q = 'a\\\nreturn 2';\nfoo();");
        assert_eq!(lines[1], "return 1`;");
        assert_eq!(lines[3], "return 2';");
        assert_eq!(lines[4], "t(6);foo();");
    }

    #[test]
    fn test_template_substitution_with_block_body() {
        let lines = tracked("const s = `${items.map((i) => {\n  return i;\n})}`;\nbar();");
        assert_eq!(lines[1], "t(3);  return i;");
        assert_eq!(lines[2], "})}`;");
        assert_eq!(lines[3], "t(5);bar();");
    }

    #[test]
    fn test_unbraced_bodies_and_else() {
        let lines = tracked("if (a)\n  b();\nelse\n  c();\nfor (const x of y)\n  z(x);\nnext();");
        assert_eq!(lines[1], "  b();");
        assert_eq!(lines[2], "else");
        assert_eq!(lines[3], "  c();");
        assert_eq!(lines[5], "  z(x);");
        assert_eq!(lines[6], "t(8);next();");
    }

    #[test]
    fn test_blocks_are_entered() {
        let lines = tracked("try {\n  a();\n} catch (e) {\n  b();\n} finally {\n  c();\n}\nfunction f() {\n  d();\n}");
        assert_eq!(lines[1], "t(3);  a();");
        assert_eq!(lines[2], "} catch (e) {");
        assert_eq!(lines[3], "t(5);  b();");
        assert_eq!(lines[5], "t(7);  c();");
        assert_eq!(lines[7], "t(9);function f() {");
        assert_eq!(lines[8], "t(10);  d();");
    }

    #[test]
    fn test_comments_and_regex() {
        let lines = tracked("// note\nconst r = /[/]'/g;\n/* a\nb */\nx();");
        assert_eq!(lines[0], "// note");
        assert_eq!(lines[1], "t(3);const r = /[/]'/g;");
        assert_eq!(lines[3], "b */");
        assert_eq!(lines[4], "t(6);x();");
    }

    #[test]
    fn test_do_while_tail() {
        let lines = tracked("do {\n  a();\n}\nwhile (b);\nc();");
        assert_eq!(lines[1], "t(3);  a();");
        assert_eq!(lines[3], "while (b);");
        assert_eq!(lines[4], "t(6);c();");
    }
}
