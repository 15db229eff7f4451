//! ARPA text-format reader.
//!
//! Sections: a `\data\` header with `ngram N=count` lines, one `\N-grams:`
//! block per order (`prob word... [backoff]` per line), then `\end\`.
//! Log probabilities are used exactly as stored; no base conversion.

use std::fs;
use std::path::Path;

use super::{LmError, NGramLm, ProbBackoff, UNK_INDEX};

enum Section {
    Preamble,
    Data,
    Grams(usize),
    Done,
}

pub fn parse_arpa(text: &str) -> Result<NGramLm, LmError> {
    let mut lm = NGramLm::empty();
    let mut section = Section::Preamble;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let fail = |msg: String| LmError::Parse { line: idx + 1, msg };
        if line.is_empty() {
            continue;
        }
        match section {
            Section::Preamble => {
                if line == "\\data\\" {
                    section = Section::Data;
                }
                // Anything before \data\ is a comment.
            }
            Section::Data => {
                if let Some(rest) = line.strip_prefix("ngram ") {
                    let (n, count) = rest
                        .split_once('=')
                        .ok_or_else(|| fail(format!("malformed count line {line:?}")))?;
                    let n: usize = n
                        .trim()
                        .parse()
                        .map_err(|_| fail(format!("bad order in {line:?}")))?;
                    let _count: usize = count
                        .trim()
                        .parse()
                        .map_err(|_| fail(format!("bad count in {line:?}")))?;
                    if n == 0 {
                        return Err(fail("ngram order 0".to_string()));
                    }
                    while lm.ngrams.len() < n {
                        lm.ngrams.push(Default::default());
                    }
                } else if let Some(n) = parse_section_header(line) {
                    section = Section::Grams(n);
                } else {
                    return Err(fail(format!("unexpected line {line:?} in \\data\\")));
                }
            }
            Section::Grams(n) => {
                if let Some(next) = parse_section_header(line) {
                    section = Section::Grams(next);
                    continue;
                }
                if line == "\\end\\" {
                    section = Section::Done;
                    continue;
                }
                let fields: Vec<&str> = line.split_whitespace().collect();
                // prob + n words, optionally followed by a backoff weight.
                let has_backoff = fields.len() == n + 2;
                if !has_backoff && fields.len() != n + 1 {
                    return Err(fail(format!(
                        "expected {} or {} fields for a {n}-gram, found {}",
                        n + 1,
                        n + 2,
                        fields.len()
                    )));
                }
                let prob: f64 = fields[0]
                    .parse()
                    .map_err(|_| fail(format!("bad log probability {:?}", fields[0])))?;
                let backoff: f64 = if has_backoff {
                    fields[n + 1]
                        .parse()
                        .map_err(|_| fail(format!("bad backoff {:?}", fields[n + 1])))?
                } else {
                    0.0
                };
                let key: Vec<u32> = fields[1..=n].iter().map(|w| lm.intern(w)).collect();
                if n > lm.ngrams.len() {
                    return Err(fail(format!("{n}-gram outside declared orders")));
                }
                lm.ngrams[n - 1].insert(key, ProbBackoff { prob, backoff });
            }
            Section::Done => {}
        }
    }
    match section {
        Section::Done => {
            // A model with no <unk> entry scores unknowns at the floor.
            lm.ngrams
                .first_mut()
                .ok_or(LmError::Empty)?
                .entry(vec![UNK_INDEX])
                .or_insert(ProbBackoff {
                    prob: super::UNK_FLOOR,
                    backoff: 0.0,
                });
            Ok(lm)
        }
        _ => Err(LmError::Truncated),
    }
}

fn parse_section_header(line: &str) -> Option<usize> {
    line.strip_prefix('\\')?
        .strip_suffix("-grams:")?
        .parse()
        .ok()
}

pub fn load_arpa(path: &Path) -> Result<NGramLm, LmError> {
    parse_arpa(&fs::read_to_string(path)?)
}
