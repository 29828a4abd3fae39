//! Ranking rules and the comparators built from them.

use std::cmp::Ordering;

use crate::docrank::DocRank;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    Typos,
    Proximity,
    Position,
    Exact,
    Field,
    /// By the configured number, descending.
    Custom,
    /// By the configured number, ascending.
    CustomAsc,
}

impl Rule {
    pub const DEFAULT: [Rule; 4] = [Rule::Typos, Rule::Proximity, Rule::Position, Rule::Exact];

    pub fn name(self) -> &'static str {
        match self {
            Rule::Typos => "typos",
            Rule::Proximity => "proximity",
            Rule::Position => "position",
            Rule::Exact => "exact",
            Rule::Field => "field",
            Rule::Custom => "custom",
            Rule::CustomAsc => "custom_asc",
        }
    }

    /// Rules a user may list. The custom rules come from `rankBy`.
    pub fn parse(name: &str) -> Result<Rule, Error> {
        match name {
            "typos" => Ok(Rule::Typos),
            "proximity" => Ok(Rule::Proximity),
            "position" => Ok(Rule::Position),
            "exact" => Ok(Rule::Exact),
            "field" => Ok(Rule::Field),
            _ => Err(Error::invalid(format!("Invalid ranking rule {}", name))),
        }
    }

    pub fn parse_all(names: &[String]) -> Result<Vec<Rule>, Error> {
        names.iter().map(|n| Rule::parse(n)).collect()
    }

    fn compare(self, a: &DocRank, b: &DocRank) -> Ordering {
        match self {
            Rule::Typos => a.typos.cmp(&b.typos),
            Rule::Proximity => a.proximity.cmp(&b.proximity),
            Rule::Position => a.position.cmp(&b.position),
            Rule::Exact => b.exact.cmp(&a.exact),
            Rule::Field => a.field.cmp(&b.field),
            Rule::Custom => compare_numbers(a.comp, b.comp, false),
            Rule::CustomAsc => compare_numbers(a.comp, b.comp, true),
        }
    }
}

/// Documents without the number sort last in either direction.
fn compare_numbers(a: f64, b: f64, asc: bool) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let o = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            if asc {
                o
            } else {
                o.reverse()
            }
        }
    }
}

/// Full rule chain: the user rules, then the custom number if any, then
/// field unless already listed. Ties fall back to docid and shard so every order is total.
#[derive(Clone, Debug, PartialEq)]
pub struct RankOrder {
    rules: Vec<Rule>,
}

impl RankOrder {
    pub fn new(rules: &[Rule], custom: Option<bool>) -> RankOrder {
        let mut chain = rules.to_vec();
        match custom {
            Some(true) => chain.push(Rule::CustomAsc),
            Some(false) => chain.push(Rule::Custom),
            None => {}
        }
        if !chain.contains(&Rule::Field) {
            chain.push(Rule::Field);
        }
        RankOrder { rules: chain }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn compare(&self, a: &DocRank, b: &DocRank) -> Ordering {
        for rule in &self.rules {
            match rule.compare(a, b) {
                Ordering::Equal => continue,
                o => return o,
            }
        }
        a.docid.cmp(&b.docid).then(a.shard.cmp(&b.shard))
    }

    pub fn sort(&self, ranks: &mut [DocRank]) {
        ranks.sort_unstable_by(|a, b| self.compare(a, b));
    }

    /// Keeps the best `k` ranks, sorted.
    pub fn partial_sort(&self, ranks: &mut Vec<DocRank>, k: usize) {
        if k == 0 {
            ranks.clear();
            return;
        }
        if k < ranks.len() {
            ranks.select_nth_unstable_by(k - 1, |a, b| self.compare(a, b));
            ranks.truncate(k);
        }
        self.sort(ranks);
    }

    /// Merges the sorted lists of several shards into the best `k`.
    pub fn merge(&self, lists: Vec<Vec<DocRank>>, k: usize) -> Vec<DocRank> {
        let mut all: Vec<DocRank> = lists.into_iter().flatten().collect();
        self.partial_sort(&mut all, k);
        all
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::Config;

    fn rank(docid: u32, typos: u8, proximity: u16, comp: f64) -> DocRank {
        DocRank {
            docid,
            typos,
            proximity,
            comp,
            ..DocRank::default()
        }
    }

    #[test]
    fn parse_rules() {
        let names: Vec<String> = vec!["typos".into(), "field".into()];
        assert_eq!(vec![Rule::Typos, Rule::Field], Rule::parse_all(&names).unwrap());
        match Rule::parse("custom") {
            Err(Error::InvalidInput(msg)) => assert_eq!("Invalid ranking rule custom", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rules_apply_in_order() {
        let order = RankOrder::new(&Rule::DEFAULT, None);
        let mut ranks = vec![rank(1, 1, 0, 0.0), rank(2, 0, 5, 0.0), rank(3, 0, 1, 0.0)];
        order.sort(&mut ranks);
        let ids: Vec<u32> = ranks.iter().map(|r| r.docid).collect();
        assert_eq!(vec![3, 2, 1], ids);
    }

    #[test]
    fn custom_number_nan_last() {
        let desc = RankOrder::new(&[], Some(false));
        let asc = RankOrder::new(&[], Some(true));
        let mut ranks = vec![rank(1, 0, 0, std::f64::NAN), rank(2, 0, 0, 5.0), rank(3, 0, 0, 9.0)];
        desc.sort(&mut ranks);
        assert_eq!(vec![3, 2, 1], ranks.iter().map(|r| r.docid).collect::<Vec<_>>());
        asc.sort(&mut ranks);
        assert_eq!(vec![2, 3, 1], ranks.iter().map(|r| r.docid).collect::<Vec<_>>());
    }

    #[test]
    fn field_rule_appended_once() {
        let order = RankOrder::new(&[Rule::Typos], Some(false));
        assert_eq!(&[Rule::Typos, Rule::Custom, Rule::Field], order.rules());
        let order = RankOrder::new(&[Rule::Field, Rule::Typos], None);
        assert_eq!(&[Rule::Field, Rule::Typos], order.rules());
    }

    proptest! {
        #![proptest_config(Config::with_cases(200))]
        #[test]
        fn partial_sort_is_prefix_of_full_sort(
            keys in prop::collection::vec((0u8..3, 0u16..4, 0u16..3), 0..60),
            k in 0usize..70,
        ) {
            let order = RankOrder::new(&Rule::DEFAULT, None);
            let ranks: Vec<DocRank> = keys
                .iter()
                .enumerate()
                .map(|(i, &(t, p, pos))| DocRank {
                    docid: i as u32,
                    shard: (i % 3) as u16,
                    typos: t,
                    proximity: p,
                    position: pos,
                    ..DocRank::default()
                })
                .collect();
            let mut full = ranks.clone();
            order.sort(&mut full);
            full.truncate(k);
            let mut part = ranks;
            order.partial_sort(&mut part, k);
            prop_assert_eq!(full, part);
        }
    }
}
