//! Shell driver-script reader.
//!
//! Driver scripts are straight-line shell: optional `VAR=value` lines and a
//! series of `python train.py --flag value ...` commands, often broken over
//! several lines with backslash continuations. This module lexes just enough
//! shell (quotes, escapes, `$VAR`/`${VAR}` expansion, `;`/`&&`/`&` separators,
//! redirections, comments) to recover every trainer invocation with its line.

use super::{Invocation, Origin, flags};
use crate::error::SweepError;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use tracing::debug;

/// A command in the script that is not a trainer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCommand {
    pub line: usize,
    pub command: String,
}

/// Parsed contents of a driver script.
#[derive(Debug, Clone, Default)]
pub struct DriverScript {
    pub path: PathBuf,
    pub invocations: Vec<Invocation>,
    pub skipped: Vec<SkippedCommand>,
}

/// Read and parse the driver script at `path`.
///
/// `trainer_script` is the file name of the trainer entry point (usually
/// `train.py`); a command is a trainer invocation when one of its words has
/// that file name.
pub fn read_script(path: &Path, trainer_script: &str) -> Result<DriverScript, SweepError> {
    let source = std::fs::read_to_string(path)?;
    parse_script(path, &source, trainer_script)
}

/// Parse driver-script `source`; `path` is only used for error locations.
pub fn parse_script(
    path: &Path,
    source: &str,
    trainer_script: &str,
) -> Result<DriverScript, SweepError> {
    let mut script = DriverScript {
        path: path.to_path_buf(),
        ..Default::default()
    };
    let mut vars: BTreeMap<String, String> = BTreeMap::new();

    for (line, text) in logical_lines(source) {
        let script_err = |message: String| SweepError::Script {
            path: path.to_path_buf(),
            line,
            message,
        };

        if line == 1 && text.starts_with("#!") {
            continue;
        }

        let tokens = Lexer::new(&text, &vars).run().map_err(script_err)?;

        for command in tokens.split(|t| matches!(t, Token::Sep)) {
            let mut words: Vec<&Word> = command
                .iter()
                .filter_map(|t| match t {
                    Token::Word(w) => Some(w),
                    Token::Sep => None,
                })
                .collect();
            if words.is_empty() {
                continue;
            }
            if words[0].text == "export" {
                words.remove(0);
            }

            if words.iter().all(|w| split_assignment(&w.text).is_some()) {
                for word in &words {
                    if let Some((name, value)) = split_assignment(&word.text) {
                        vars.insert(name.to_string(), value.to_string());
                    }
                }
                continue;
            }

            let Some(trainer_at) = words.iter().position(|w| is_trainer(&w.text, trainer_script))
            else {
                script.skipped.push(SkippedCommand {
                    line,
                    command: words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "),
                });
                continue;
            };

            if let Some(word) = words.iter().find(|w| w.unresolved) {
                return Err(script_err(format!(
                    "unresolved shell variable in '{}'",
                    word.text
                )));
            }

            let args: Vec<&str> = words[trainer_at + 1..].iter().map(|w| w.text.as_str()).collect();
            let mut invocation = flags::parse_argv(&args).map_err(|e| script_err(e.to_string()))?;

            for word in &words[..trainer_at] {
                if let Some((name, value)) = split_assignment(&word.text) {
                    invocation.env.insert(name.to_string(), value.to_string());
                }
            }
            invocation.origin = Some(Origin {
                path: path.to_path_buf(),
                line,
            });
            debug!(line, name = %invocation.args.name, "Parsed trainer invocation");
            script.invocations.push(invocation);
        }
    }

    Ok(script)
}

/// Quote `token` for a POSIX shell, leaving plain tokens untouched.
pub fn quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

fn is_trainer(word: &str, trainer_script: &str) -> bool {
    Path::new(word)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == trainer_script)
}

fn split_assignment(word: &str) -> Option<(&str, &str)> {
    let (name, value) = word.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Some((name, value))
    } else {
        None
    }
}

/// Join backslash-continued physical lines, keeping the first line number.
///
/// Comments are cut from each physical line first: a comment always ends at
/// the newline, even when it ends in a backslash.
fn logical_lines(source: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current: Option<(usize, String)> = None;
    let mut quote: Option<char> = None;

    for (idx, raw) in source.lines().enumerate() {
        if current.is_none() {
            quote = None;
        }
        let trimmed = strip_comment(raw, &mut quote).trim_end();
        let trailing = trimmed.len() - trimmed.trim_end_matches('\\').len();
        let continued = trailing % 2 == 1;
        let body = if continued {
            &trimmed[..trimmed.len() - 1]
        } else {
            trimmed
        };

        let entry = current.get_or_insert_with(|| (idx + 1, String::new()));
        if !entry.1.is_empty() {
            entry.1.push(' ');
        }
        entry.1.push_str(body.trim_start());

        if !continued {
            lines.extend(current.take());
        }
    }
    lines.extend(current.take());
    lines
}

/// `line` up to an unquoted `#` that starts a word. `quote` carries the open
/// quote character from a previous continued line.
fn strip_comment<'a>(line: &'a str, quote: &mut Option<char>) -> &'a str {
    let mut prev: Option<char> = None;
    let mut chars = line.char_indices();
    while let Some((at, c)) = chars.next() {
        match (*quote, c) {
            (Some('\''), '\'') => *quote = None,
            (Some('\''), _) => {}
            (Some(_), '\\') | (None, '\\') => {
                chars.next();
            }
            (Some(open), c) if c == open => *quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => *quote = Some(c),
            (None, '#')
                if prev.is_none_or(|p| p.is_whitespace() || matches!(p, ';' | '&' | '|' | '(')) =>
            {
                return &line[..at];
            }
            _ => {}
        }
        prev = Some(c);
    }
    line
}

#[derive(Debug, Clone, PartialEq)]
struct Word {
    text: String,
    unresolved: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(Word),
    Sep,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    vars: &'a BTreeMap<String, String>,
    tokens: Vec<Token>,
    word: String,
    in_word: bool,
    unresolved: bool,
    drop_next_word: bool,
}

impl<'a> Lexer<'a> {
    fn new(line: &'a str, vars: &'a BTreeMap<String, String>) -> Self {
        Self {
            chars: line.chars().peekable(),
            vars,
            tokens: Vec::new(),
            word: String::new(),
            in_word: false,
            unresolved: false,
            drop_next_word: false,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, String> {
        while let Some(c) = self.chars.next() {
            match c {
                ' ' | '\t' => self.finish_word(),
                '#' if !self.in_word => break,
                '\'' => {
                    self.in_word = true;
                    loop {
                        match self.chars.next() {
                            Some('\'') => break,
                            Some(ch) => self.word.push(ch),
                            None => return Err("unterminated single quote".to_string()),
                        }
                    }
                }
                '"' => {
                    self.in_word = true;
                    loop {
                        match self.chars.next() {
                            Some('"') => break,
                            Some('\\') => match self.chars.peek().copied() {
                                Some(next @ ('"' | '\\' | '$' | '`')) => {
                                    self.chars.next();
                                    self.word.push(next);
                                }
                                _ => self.word.push('\\'),
                            },
                            Some('$') => self.expand()?,
                            Some(ch) => self.word.push(ch),
                            None => return Err("unterminated double quote".to_string()),
                        }
                    }
                }
                '\\' => {
                    self.in_word = true;
                    if let Some(next) = self.chars.next() {
                        self.word.push(next);
                    }
                }
                '$' => {
                    self.in_word = true;
                    self.expand()?;
                }
                ';' => self.separator(),
                '&' | '|' => {
                    if self.chars.peek() == Some(&c) {
                        self.chars.next();
                    }
                    self.separator();
                }
                '>' | '<' => self.redirect(),
                '`' => return Err("command substitution is not supported".to_string()),
                other => {
                    self.in_word = true;
                    self.word.push(other);
                }
            }
        }
        self.finish_word();
        Ok(self.tokens)
    }

    fn finish_word(&mut self) {
        if !self.in_word {
            return;
        }
        let text = std::mem::take(&mut self.word);
        let unresolved = std::mem::take(&mut self.unresolved);
        self.in_word = false;
        if self.drop_next_word {
            self.drop_next_word = false;
        } else {
            self.tokens.push(Token::Word(Word { text, unresolved }));
        }
    }

    fn separator(&mut self) {
        self.finish_word();
        if matches!(self.tokens.last(), Some(Token::Word(_))) {
            self.tokens.push(Token::Sep);
        }
    }

    /// Drop a redirection and its target: `> log`, `2>&1`, `>> out.txt`.
    fn redirect(&mut self) {
        if self.in_word && self.word.chars().all(|c| c.is_ascii_digit()) {
            self.word.clear();
            self.in_word = false;
        } else {
            self.finish_word();
        }
        if self.chars.peek() == Some(&'>') {
            self.chars.next();
        }
        if self.chars.peek() == Some(&'&') {
            self.chars.next();
            while self
                .chars
                .peek()
                .is_some_and(|c| c.is_ascii_digit() || *c == '-')
            {
                self.chars.next();
            }
            return;
        }
        self.drop_next_word = true;
    }

    /// Expand `$NAME`, `${NAME}` and `${NAME:-default}` after a `$`.
    fn expand(&mut self) -> Result<(), String> {
        let mut name = String::new();
        if self.chars.peek() == Some(&'{') {
            self.chars.next();
            loop {
                match self.chars.next() {
                    Some('}') => break,
                    Some(ch) => name.push(ch),
                    None => return Err("unterminated ${".to_string()),
                }
            }
        } else if self
            .chars
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || "@*#?".contains(*c))
        {
            name.extend(self.chars.next());
        } else {
            while let Some(&c) = self.chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    self.chars.next();
                } else {
                    break;
                }
            }
        }

        if name.is_empty() {
            self.word.push('$');
            return Ok(());
        }

        let (var, default) = match name.split_once(":-") {
            Some((var, default)) => (var, Some(default)),
            None => (name.as_str(), None),
        };
        match (self.vars.get(var), default) {
            (Some(value), _) => self.word.push_str(value),
            (None, Some(default)) => self.word.push_str(default),
            (None, None) => {
                self.unresolved = true;
                self.word.push_str(&format!("${{{var}}}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{Label, Resize};
    use pretty_assertions::assert_eq;

    const DRIVER: &str = r#"#!/bin/bash
# EfficientNet-b4 per-label runs
EPOCHS=30

python train.py --epochs $EPOCHS --dataset MaskSplitByProfileDataset --label mask \
    --augmentation CustomAugmentation --resize 256 192 --lr 1e-4 --lr_decay_step 10 \
    --lr_gamma 0.5 --batch_size 32 --valid_batch_size 128 --model EfficientNet \
    --model_version b4 --optimizer AdamW --criterion focal --log_interval 20 --name effb4_mask

python train.py --epochs ${EPOCHS} --dataset MaskSplitByProfileDataset --label gender \
    --augmentation CustomAugmentation --resize 256 192 --lr 1e-4 --lr_decay_step 10 \
    --lr_gamma 0.5 --batch_size 32 --valid_batch_size 128 --model EfficientNet \
    --model_version b4 --optimizer AdamW --criterion focal --log_interval 20 --name "effb4_gender"

echo "done with gender"
CUDA_VISIBLE_DEVICES=0 python3 -u ./train.py --epochs 30 --dataset MaskSplitByProfileDataset --label age --augmentation CustomAugmentation --resize 256 192 --lr 1e-4 --lr_decay_step 10 --lr_gamma 0.5 --batch_size 32 --valid_batch_size 128 --model EfficientNet --model_version b4 --optimizer AdamW --criterion label_smoothing --log_interval 20 --name effb4_age --exist_ok > age.log 2>&1
"#;

    fn parse(source: &str) -> Result<DriverScript, SweepError> {
        parse_script(Path::new("run.sh"), source, "train.py")
    }

    #[test]
    fn test_reads_all_invocations() {
        let script = parse(DRIVER).unwrap();
        assert_eq!(script.invocations.len(), 3);

        let labels: Vec<Label> = script.invocations.iter().map(|i| i.args.label).collect();
        assert_eq!(labels, vec![Label::Mask, Label::Gender, Label::Age]);

        let lines: Vec<usize> = script
            .invocations
            .iter()
            .map(|i| i.origin.as_ref().unwrap().line)
            .collect();
        assert_eq!(lines, vec![5, 10, 16]);

        for inv in &script.invocations {
            assert_eq!(inv.args.epochs, 30);
            assert_eq!(inv.args.resize, Resize(256, 192));
            assert!(inv.check().is_empty(), "{:?}", inv.check());
        }
    }

    #[test]
    fn test_env_prefix_and_redirects() {
        let script = parse(DRIVER).unwrap();
        let age = &script.invocations[2];
        assert_eq!(age.env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("0"));
        assert!(age.args.exist_ok);
        assert_eq!(age.args.criterion, "label_smoothing");
        assert_eq!(age.args.name, "effb4_age");
    }

    #[test]
    fn test_non_trainer_commands_are_skipped() {
        let script = parse(DRIVER).unwrap();
        assert_eq!(
            script.skipped,
            vec![SkippedCommand {
                line: 15,
                command: "echo done with gender".into(),
            }]
        );
    }

    #[test]
    fn test_flag_error_reports_line() {
        let source = "echo start\npython train.py --epochs 3 --resize 256\n";
        let err = parse(source).unwrap_err();
        match err {
            SweepError::Script { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("exactly 2 integers"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unresolved_variable_in_trainer_command() {
        let err = parse("python train.py --label $LABEL\n").unwrap_err();
        assert!(err.to_string().contains("${LABEL}"));

        // Harmless outside trainer commands.
        let script = parse("echo $HOME\n").unwrap();
        assert_eq!(script.skipped.len(), 1);
    }

    #[test]
    fn test_default_expansion_and_chaining() {
        let source = "cd /opt/ml && python train.py --epochs ${EPOCHS:-5} --name a; python train.py --name b &\n";
        let script = parse(source).unwrap();
        assert_eq!(script.invocations.len(), 2);
        assert_eq!(script.invocations[0].args.epochs, 5);
        assert_eq!(script.invocations[1].args.name, "b");
        assert_eq!(script.skipped[0].command, "cd /opt/ml");
    }

    #[test]
    fn test_comments_and_quotes() {
        let source = "python train.py --name 'my#run' --model \"Base\\\"Model\" # trailing\n";
        let script = parse(source).unwrap();
        assert_eq!(script.invocations[0].args.name, "my#run");
        assert_eq!(script.invocations[0].args.model, "Base\"Model");
    }

    #[test]
    fn test_unterminated_quote() {
        let err = parse("python train.py --name 'oops\n").unwrap_err();
        assert!(err.to_string().contains("unterminated single quote"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("effb4_mask"), "effb4_mask");
        assert_eq!(quote("1e-4"), "1e-4");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_comment_ending_in_backslash_does_not_swallow_next_line() {
        let source = "# python train.py --name old \\\npython train.py --name keep\n";
        let script = parse(source).unwrap();
        assert_eq!(script.invocations.len(), 1);
        assert_eq!(script.invocations[0].args.name, "keep");
        assert_eq!(script.invocations[0].origin.as_ref().unwrap().line, 2);

        let source = "python train.py --name a # note \\\npython train.py --name b\n";
        let names: Vec<String> = parse(source)
            .unwrap()
            .invocations
            .into_iter()
            .map(|i| i.args.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_strip_comment() {
        let mut quote = None;
        assert_eq!(strip_comment("a 'b # c' # d", &mut quote), "a 'b # c' ");
        assert_eq!(strip_comment("x$#y \\# z", &mut quote), "x$#y \\# z");
        assert_eq!(strip_comment("--name \"open # \\", &mut quote), "--name \"open # \\");
        assert_eq!(quote, Some('"'));
        assert_eq!(strip_comment("still\" # gone", &mut quote), "still\" ");
        assert_eq!(quote, None);
    }

    #[test]
    fn test_logical_lines() {
        let lines = logical_lines("a \\\n  b \\\n  c\nd\n");
        assert_eq!(lines, vec![(1, "a  b  c".to_string()), (4, "d".to_string())]);
    }
}
