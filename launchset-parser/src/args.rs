use crate::grammar::{ArgsParser, Rule};
use launchset_core::{LaunchsetError, Result};
use pest::Parser;

/// Split an argument string into words the way a POSIX shell would,
/// without any expansion
pub fn parse_args(input: &str) -> Result<Vec<String>> {
    let mut pairs = ArgsParser::parse(Rule::args, input)
        .map_err(|e| LaunchsetError::ParseError(format!("Invalid argument string: {}", e)))?;

    let args_pair = pairs.next().ok_or_else(|| {
        LaunchsetError::ParseError("Empty argument parse tree".to_string())
    })?;

    Ok(args_pair
        .into_inner()
        .filter(|pair| pair.as_rule() == Rule::word)
        .map(parse_word)
        .collect())
}

fn parse_word(pair: pest::iterators::Pair<Rule>) -> String {
    let mut word = String::new();

    for fragment in pair.into_inner() {
        match fragment.as_rule() {
            Rule::single_quoted => {
                if let Some(inner) = fragment.into_inner().next() {
                    word.push_str(inner.as_str());
                }
            }
            Rule::double_quoted => {
                if let Some(inner) = fragment.into_inner().next() {
                    unescape_double_quoted(inner.as_str(), &mut word);
                }
            }
            Rule::bare => unescape_bare(fragment.as_str(), &mut word),
            _ => {}
        }
    }

    word
}

// Inside double quotes a backslash only escapes `"`, `\`, `$` and backtick.
fn unescape_double_quoted(s: &str, out: &mut String) {
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(next @ ('"' | '\\' | '$' | '`')) => out.push(next),
            Some(next) => {
                out.push('\\');
                out.push(next);
            }
            None => out.push('\\'),
        }
    }
}

fn unescape_bare(s: &str, out: &mut String) {
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
}
