//! End-to-end pipeline: grammar + LM -> chart decode -> tuning support.

use sylva_core::decoder::{CfgLmDecoder, DecoderConfig};
use sylva_core::eval::BleuEvaluator;
use sylva_core::features::parse_weights;
use sylva_core::grammar::{parse_rule_table, trie::RuleFsm};
use sylva_core::lm::{parse_arpa, LmData};
use sylva_core::tune::ForestTuningExample;
use sylva_core::Vocab;

const GRAMMAR: &str = "\
le ||| the ||| p=0.2
chat ||| cat ||| p=0.2
chat ||| chat ||| p=0.1
dort ||| sleeps ||| p=0.2
[X0] [X1] @ X ||| [X0] [X1] @ X ||| glue=0.1
[X0] @ S ||| [X0] @ S ||| top=0.1
";

const ARPA: &str = "\
\\data\\
ngram 1=7
ngram 2=3

\\1-grams:
-100\t<unk>
-1.5\t<s>\t-0.1
-0.8\tthe\t-0.2
-1.0\tcat\t-0.2
-2.5\tchat\t-0.1
-1.2\tsleeps\t-0.2
-1.1\t</s>

\\2-grams:
-0.3\tthe cat
-0.4\tcat sleeps
-0.5\tsleeps </s>

\\end\\
";

fn weights_text() -> &'static str {
    "p 1\nglue 1\ntop 1\nlm 1\nlmunk 1\n"
}

#[test]
fn decode_then_tune() {
    let vocab = Vocab::new();
    let rules = parse_rule_table(&vocab, GRAMMAR).unwrap();
    let fsm = RuleFsm::from_rules(rules);
    let lm = LmData::new(parse_arpa(ARPA).unwrap(), &vocab, 1.0, 1.0);
    let weights = parse_weights(&vocab, weights_text()).unwrap();
    let config = DecoderConfig {
        pop_limit: Some(500),
        ..Default::default()
    };
    let decoder = CfgLmDecoder::new(&vocab, &[&fsm], vec![lm], weights.clone(), &config).unwrap();

    let sent = vocab.parse_words("le chat dort").unwrap();
    let hg = decoder.decode(&sent).unwrap();
    assert!(!hg.is_empty());

    // The LM prefers translating "chat" over copying it.
    let nbest = hg.nbest(5);
    assert_eq!(vocab.print_words(&nbest[0].words), "the cat sleeps");
    assert!(nbest
        .iter()
        .any(|e| vocab.print_words(&e.words) == "the chat sleeps"));

    // Tuning: the decoded forest against its reference.
    let ref_sent = vocab.parse_words("the cat sleeps").unwrap();
    let mut example = ForestTuningExample::new(ref_sent, 1);
    example.add_hypothesis(&hg);
    example.find_active_features();

    let mut bleu = BleuEvaluator::default();
    example.calculate_oracle(&vocab, &mut bleu);
    assert!((example.oracle_score() - 1.0).abs() < 1e-9);

    // The model hypothesis already matches the oracle: no gain left.
    let gain = example.calculate_potential_gain(&mut bleu, &weights);
    let p = vocab.get("p").unwrap();
    assert_eq!(gain.get(p), 0.0);

    // Moving along the p axis never changes which derivation wins the
    // whole line, but the hull still covers it.
    let gradient = parse_weights(&vocab, "p 1.0").unwrap();
    let hull = example.calculate_convex_hull(&mut bleu, &weights, &gradient);
    assert!(!hull.is_empty());
    let total_width: f64 = hull
        .iter()
        .map(|((l, r), _)| if r > l { 1.0 } else { 0.0 })
        .sum();
    assert!(total_width >= 1.0);
    // The interval at the current weights scores the current hypothesis.
    let at_zero = hull
        .iter()
        .find(|((l, r), _)| *l <= 0.0 && 0.0 <= *r)
        .expect("hull covers t = 0");
    assert!((at_zero.1.score() - 1.0).abs() < 1e-9);
}
