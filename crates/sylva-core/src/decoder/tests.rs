use super::*;
use crate::features::parse_weights;
use crate::grammar::parse_rule_table;
use crate::lm::parse_arpa;

const GRAMMAR: &str = "\
a ||| A ||| p=0.1
b ||| B ||| p=0.1
[X0] [X1] @ S ||| [X0] [X1] @ S ||| glue=1
";

const ARPA: &str = "\
\\data\\
ngram 1=5
ngram 2=1

\\1-grams:
-100\t<unk>
-2.0\t<s>\t0
-1.0\tA\t0
-1.0\tB\t0
-1.0\t</s>

\\2-grams:
-0.5\tA B

\\end\\
";

struct Fixture {
    vocab: Vocab,
    fsm: RuleFsm,
}

impl Fixture {
    fn new(grammar: &str) -> Self {
        let vocab = Vocab::new();
        let rules = parse_rule_table(&vocab, grammar).unwrap();
        let fsm = RuleFsm::from_rules(rules);
        Fixture { vocab, fsm }
    }

    fn decoder(&self, arpa: &str, config: &DecoderConfig) -> CfgLmDecoder<'_> {
        let lm = LmData::new(parse_arpa(arpa).unwrap(), &self.vocab, 1.0, 1.0);
        let weights = parse_weights(&self.vocab, "p 1\nglue 1\nlm 1\nlmunk 1\n").unwrap();
        CfgLmDecoder::new(&self.vocab, &[&self.fsm], vec![lm], weights, config).unwrap()
    }
}

#[test]
fn decodes_two_word_sentence() {
    let fx = Fixture::new(GRAMMAR);
    let config = DecoderConfig {
        pop_limit: Some(100),
        ..Default::default()
    };
    let dec = fx.decoder(ARPA, &config);
    let sent = fx.vocab.parse_words("a b").unwrap();
    let hg = dec.decode(&sent).unwrap();

    let nbest = hg.nbest(1);
    assert_eq!(nbest.len(), 1);
    assert_eq!(fx.vocab.print_words(&nbest[0].words), "A B");

    // One root edge, two terminal edges, one glue edge.
    assert_eq!(hg.node(0).edges.len(), 1);
    let terminal_edges = hg.edges().iter().filter(|e| e.tails.is_empty()).count();
    assert_eq!(terminal_edges, 2);
    assert_eq!(hg.num_edges(), 4);
}

#[test]
fn edge_scores_match_weighted_features() {
    let fx = Fixture::new(GRAMMAR);
    let dec = fx.decoder(ARPA, &DecoderConfig::default());
    let weights = parse_weights(&fx.vocab, "p 1\nglue 1\nlm 1\nlmunk 1\n").unwrap();
    let sent = fx.vocab.parse_words("a b").unwrap();
    let hg = dec.decode(&sent).unwrap();
    for edge in hg.edges() {
        let expected = weights.dot(&edge.features);
        assert!(
            (edge.score - expected).abs() < 1e-9,
            "edge {} score {} != weighted features {}",
            edge.id,
            edge.score,
            expected
        );
    }
}

#[test]
fn unary_rules_expand_from_the_same_span() {
    let fx = Fixture::new(
        "\
a ||| A ||| p=0.5
[X0] @ S ||| [X0] @ S ||| glue=0.5
",
    );
    let dec = fx.decoder(ARPA, &DecoderConfig::default());
    let sent = fx.vocab.parse_words("a").unwrap();
    let hg = dec.decode(&sent).unwrap();
    let nbest = hg.nbest(1);
    assert_eq!(nbest.len(), 1);
    assert_eq!(fx.vocab.print_words(&nbest[0].words), "A");
}

#[test]
fn chart_limit_bounds_nodes_per_span() {
    let grammar = "\
a ||| A ||| p=0.3
a ||| A2 ||| p=0.3
b ||| B ||| p=0.3
[X0] [X1] @ S ||| [X0] [X1] @ S ||| glue=1
";
    let arpa = "\
\\data\\
ngram 1=6
ngram 2=1

\\1-grams:
-100\t<unk>
-2.0\t<s>\t0
-0.5\tA\t0
-0.9\tA2\t0
-1.0\tB\t0
-1.0\t</s>

\\2-grams:
-0.5\tA B

\\end\\
";
    let fx = Fixture::new(grammar);

    // Both lexical candidates for "a" carry distinct LM states. With a chart
    // limit of 1 only the better one survives its span.
    let tight = DecoderConfig {
        chart_limit: Some(1),
        ..Default::default()
    };
    let hg = fx
        .decoder(arpa, &tight)
        .decode(&fx.vocab.parse_words("a b").unwrap())
        .unwrap();
    let nbest = hg.nbest(10);
    assert_eq!(nbest.len(), 1);
    assert_eq!(fx.vocab.print_words(&nbest[0].words), "A B");

    let loose = DecoderConfig {
        chart_limit: Some(2),
        ..Default::default()
    };
    let hg = fx
        .decoder(arpa, &loose)
        .decode(&fx.vocab.parse_words("a b").unwrap())
        .unwrap();
    let nbest = hg.nbest(10);
    assert_eq!(nbest.len(), 2);
    assert_eq!(fx.vocab.print_words(&nbest[0].words), "A B");
    assert_eq!(fx.vocab.print_words(&nbest[1].words), "A2 B");
}

#[test]
fn pop_limit_zero_produces_nothing() {
    let fx = Fixture::new(GRAMMAR);
    let config = DecoderConfig {
        pop_limit: Some(0),
        ..Default::default()
    };
    let dec = fx.decoder(ARPA, &config);
    let hg = dec.decode(&fx.vocab.parse_words("a b").unwrap()).unwrap();
    assert!(hg.is_empty());
    assert!(hg.nbest(5).is_empty());
}

#[test]
fn empty_source_yields_empty_graph() {
    let fx = Fixture::new(GRAMMAR);
    let dec = fx.decoder(ARPA, &DecoderConfig::default());
    assert!(dec.decode(&[]).unwrap().is_empty());
}

#[test]
fn uncovered_word_blocks_the_parse() {
    let fx = Fixture::new(GRAMMAR);
    let dec = fx.decoder(ARPA, &DecoderConfig::default());
    let sent = fx.vocab.parse_words("a c b").unwrap();
    let hg = dec.decode(&sent).unwrap();
    assert!(hg.is_empty());
}

#[test]
fn repeated_decodes_are_identical() {
    let fx = Fixture::new(GRAMMAR);
    let dec = fx.decoder(ARPA, &DecoderConfig::default());
    let sent = fx.vocab.parse_words("a b").unwrap();
    let first = dec.decode(&sent).unwrap();
    let second = dec.decode(&sent).unwrap();
    assert_eq!(first.num_nodes(), second.num_nodes());
    assert_eq!(first.num_edges(), second.num_edges());
    let (na, nb) = (first.nbest(5), second.nbest(5));
    assert_eq!(na.len(), nb.len());
    for (a, b) in na.iter().zip(&nb) {
        assert_eq!(a.words, b.words);
        assert_eq!(a.score, b.score);
    }
}

#[test]
fn rejects_multiple_translation_models() {
    let fx = Fixture::new(GRAMMAR);
    let other = RuleFsm::from_rules(Vec::new());
    let weights = SparseVector::new();
    let err = CfgLmDecoder::new(
        &fx.vocab,
        &[&fx.fsm, &other],
        Vec::new(),
        weights,
        &DecoderConfig::default(),
    );
    assert!(matches!(err, Err(DecodeError::ModelCount(2))));
}
