//! Rule-table text format.
//!
//! One rule per line: `source ||| target ||| features`. Tokens are
//! whitespace-separated; a non-terminal is written `[X0]` where `X` is its
//! label and the trailing digits are the co-index linking source and target
//! slots. Either side may end with `@ LABEL` naming the head; the head
//! defaults to `X`. Features are `name=value` pairs.
//!
//! ```text
//! the [X0] @ S ||| le [X0] @ S ||| p=0.5 lex=-0.3
//! ```
//!
//! Slot indices are assigned by order of appearance on the source side; each
//! source slot must be used exactly once on the target side.

use std::collections::HashMap;

use super::{CfgData, GrammarError, TranslationRule};
use crate::features::parse_features;
use crate::vocab::{slot_id, Sentence, Vocab, WordId};

const DEFAULT_HEAD: &str = "X";
const SEPARATOR: &str = "|||";

/// A token of either rule side.
enum Token {
    Terminal(String),
    NonTerminal { label: String, coindex: u32 },
}

fn tokenize(text: &str) -> Result<(Vec<Token>, Option<String>), String> {
    let mut tokens = Vec::new();
    let mut head = None;
    let mut it = text.split_whitespace().peekable();
    while let Some(tok) = it.next() {
        if tok == "@" {
            let label = it.next().ok_or("dangling @ with no head label")?;
            if it.next().is_some() {
                return Err("tokens after head label".to_string());
            }
            head = Some(label.to_string());
            break;
        }
        if let Some(inner) = tok.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            let digits_at = inner
                .rfind(|c: char| !c.is_ascii_digit())
                .map(|i| i + 1)
                .unwrap_or(0);
            let (label, digits) = inner.split_at(digits_at);
            if label.is_empty() || digits.is_empty() {
                return Err(format!("malformed non-terminal {tok:?}"));
            }
            let coindex: u32 = digits.parse().map_err(|_| format!("bad co-index {tok:?}"))?;
            tokens.push(Token::NonTerminal {
                label: label.to_string(),
                coindex,
            });
        } else {
            tokens.push(Token::Terminal(tok.to_string()));
        }
    }
    Ok((tokens, head))
}

fn parse_src(vocab: &Vocab, text: &str) -> Result<(CfgData, HashMap<u32, usize>), String> {
    let (tokens, head) = tokenize(text)?;
    let mut words = Sentence::new();
    let mut syms = Sentence::new();
    let mut coindex_slots = HashMap::new();
    for tok in tokens {
        match tok {
            Token::Terminal(t) => words.push(vocab.intern(&t).map_err(|e| e.to_string())?),
            Token::NonTerminal { label, coindex } => {
                let slot = syms.len();
                if coindex_slots.insert(coindex, slot).is_some() {
                    return Err(format!("duplicate source co-index {coindex}"));
                }
                words.push(slot_id(slot));
                syms.push(vocab.intern(&label).map_err(|e| e.to_string())?);
            }
        }
    }
    let head = head.unwrap_or_else(|| DEFAULT_HEAD.to_string());
    let label = vocab.intern(&head).map_err(|e| e.to_string())?;
    Ok((CfgData::new(words, label, syms), coindex_slots))
}

fn parse_trg(
    vocab: &Vocab,
    text: &str,
    coindex_slots: &HashMap<u32, usize>,
) -> Result<CfgData, String> {
    let (tokens, head) = tokenize(text)?;
    let mut words = Sentence::new();
    let mut syms: Vec<Option<WordId>> = vec![None; coindex_slots.len()];
    for tok in tokens {
        match tok {
            Token::Terminal(t) => words.push(vocab.intern(&t).map_err(|e| e.to_string())?),
            Token::NonTerminal { label, coindex } => {
                let &slot = coindex_slots
                    .get(&coindex)
                    .ok_or(format!("target co-index {coindex} not present on source side"))?;
                if syms[slot].is_some() {
                    return Err(format!("target co-index {coindex} used twice"));
                }
                words.push(slot_id(slot));
                syms[slot] = Some(vocab.intern(&label).map_err(|e| e.to_string())?);
            }
        }
    }
    let syms: Sentence = syms
        .into_iter()
        .collect::<Option<_>>()
        .ok_or("source slot missing from target side")?;
    let head = head.unwrap_or_else(|| DEFAULT_HEAD.to_string());
    let label = vocab.intern(&head).map_err(|e| e.to_string())?;
    Ok(CfgData::new(words, label, syms))
}

/// Parse a single rule line.
pub fn parse_rule(vocab: &Vocab, line: &str) -> Result<TranslationRule, GrammarError> {
    let fail = |msg: String| GrammarError::Parse { line: 0, msg };
    let fields: Vec<&str> = line.split(SEPARATOR).collect();
    if fields.len() != 3 {
        return Err(fail(format!(
            "expected 3 {SEPARATOR}-separated fields, found {}",
            fields.len()
        )));
    }
    let (src, coindex_slots) = parse_src(vocab, fields[0]).map_err(fail)?;
    let trg = parse_trg(vocab, fields[1], &coindex_slots).map_err(fail)?;
    let features = parse_features(vocab, fields[2])?;
    Ok(TranslationRule::new(src, vec![trg], features))
}

/// Parse a whole rule table, reporting 1-based line numbers on failure.
/// Blank lines and `#` comments are skipped.
pub fn parse_rule_table(vocab: &Vocab, text: &str) -> Result<Vec<TranslationRule>, GrammarError> {
    let mut rules = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let rule = parse_rule(vocab, trimmed).map_err(|e| match e {
            GrammarError::Parse { msg, .. } => GrammarError::Parse { line: idx + 1, msg },
            other => other,
        })?;
        rules.push(rule);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::HieroHeadLabels;

    #[test]
    fn parses_terminal_rule() {
        let vocab = Vocab::new();
        let rule = parse_rule(&vocab, "the cat ||| le chat ||| p=0.5").unwrap();
        assert_eq!(rule.arity(), 0);
        assert_eq!(vocab.print_words(&rule.src.words), "the cat");
        assert_eq!(vocab.print_words(&rule.trg[0].words), "le chat");
        assert_eq!(rule.features.get(vocab.get("p").unwrap()), 0.5);
        // Default head label.
        let x = vocab.get("X").unwrap();
        assert_eq!(rule.head_labels, HieroHeadLabels(vec![x, x]));
    }

    #[test]
    fn parses_nonterminals_with_coindexes() {
        let vocab = Vocab::new();
        let rule =
            parse_rule(&vocab, "[X0] sat [X1] @ S ||| [X1] s'assit [X0] @ S ||| p=1").unwrap();
        assert_eq!(rule.arity(), 2);
        // Source slots in order of appearance.
        assert_eq!(rule.src.words[0], -1);
        assert_eq!(rule.src.words[2], -2);
        // Target reordered: [X1] first refers to source slot 1.
        assert_eq!(rule.trg[0].words[0], -2);
        assert_eq!(rule.trg[0].words[2], -1);
    }

    #[test]
    fn rejects_unbalanced_slots() {
        let vocab = Vocab::new();
        assert!(parse_rule(&vocab, "[X0] a ||| b ||| p=1").is_err());
        assert!(parse_rule(&vocab, "a ||| [X0] ||| p=1").is_err());
        assert!(parse_rule(&vocab, "a ||| b ||| ").is_ok());
        assert!(parse_rule(&vocab, "a ||| b").is_err());
    }

    #[test]
    fn table_reports_line_numbers() {
        let vocab = Vocab::new();
        let text = "a ||| b ||| p=1\n# comment\n\nbroken line\n";
        let err = parse_rule_table(&vocab, text).unwrap_err();
        match err {
            GrammarError::Parse { line, .. } => assert_eq!(line, 4),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
