use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical grocery taxonomy. Pantry rows are keyed on one of these, so free
/// text coming from shopping items must be normalized before it is used as part
/// of a merge key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Produce,
    Dairy,
    Meat,
    Seafood,
    Bakery,
    Pantry,
    Frozen,
    Beverages,
    Spices,
    Snacks,
    Household,
    Other,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Produce,
        Category::Dairy,
        Category::Meat,
        Category::Seafood,
        Category::Bakery,
        Category::Pantry,
        Category::Frozen,
        Category::Beverages,
        Category::Spices,
        Category::Snacks,
        Category::Household,
        Category::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Produce => "produce",
            Category::Dairy => "dairy",
            Category::Meat => "meat",
            Category::Seafood => "seafood",
            Category::Bakery => "bakery",
            Category::Pantry => "pantry",
            Category::Frozen => "frozen",
            Category::Beverages => "beverages",
            Category::Spices => "spices",
            Category::Snacks => "snacks",
            Category::Household => "household",
            Category::Other => "other",
        }
    }

    /// Exact canonical name only. Used when reading stored rows, where anything
    /// else means the row is corrupt.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked in order; the first bucket with a matching keyword wins, so more
// specific buckets come before broad ones ("frozen peas" is frozen, not produce).
// Keywords match whole words only, plurals included.
const KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Frozen, &["frozen", "freezer", "ice cream"]),
    (
        Category::Household,
        &[
            "household", "cleaning", "paper", "detergent", "toiletry", "soap", "foil",
        ],
    ),
    (
        Category::Seafood,
        &["seafood", "fish", "shellfish", "shrimp", "prawn", "salmon", "tuna"],
    ),
    (
        Category::Meat,
        &[
            "meat", "poultry", "chicken", "beef", "pork", "lamb", "steak", "deli", "butcher",
        ],
    ),
    (
        Category::Dairy,
        &["dairy", "milk", "cheese", "yogurt", "yoghurt", "butter", "egg", "cream"],
    ),
    (
        Category::Bakery,
        &["bakery", "bread", "baked", "pastry", "bagel"],
    ),
    (
        Category::Beverages,
        &["beverage", "drink", "juice", "coffee", "tea", "soda", "water", "wine", "beer"],
    ),
    (
        Category::Spices,
        &["spice", "herb", "seasoning", "condiment"],
    ),
    (
        Category::Snacks,
        &["snack", "chips", "crisps", "candy", "sweets", "cookie", "biscuit"],
    ),
    (
        Category::Produce,
        &[
            "produce", "fruit", "vegetable", "veg", "veggie", "greens", "salad", "melon",
            "watermelon", "eggplant",
        ],
    ),
    (
        Category::Pantry,
        &[
            "pantry", "dry goods", "grain", "pasta", "rice", "canned", "tinned", "baking",
            "cereal", "flour", "oil", "sauce",
        ],
    ),
];

/// `token` is `word` or one of its plural forms.
fn word_matches(token: &str, word: &str) -> bool {
    token == word
        || token
            .strip_suffix('s')
            .is_some_and(|stem| stem == word || stem.strip_suffix('e') == Some(word))
        || word
            .strip_suffix('y')
            .is_some_and(|stem| token.strip_suffix("ies") == Some(stem))
}

/// `keyword` (one or more words) appears as consecutive whole tokens.
fn keyword_matches(tokens: &[&str], keyword: &str) -> bool {
    let words: Vec<&str> = keyword.split(' ').collect();
    tokens
        .windows(words.len())
        .any(|window| window.iter().zip(&words).all(|(t, w)| word_matches(t, w)))
}

/// Map free-text or missing categories onto the canonical taxonomy, falling
/// back to [`Category::Other`].
#[must_use]
pub fn normalize_category(raw: Option<&str>) -> Category {
    let Some(raw) = raw else {
        return Category::Other;
    };
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return Category::Other;
    }
    if let Some(exact) = Category::parse(&lower) {
        return exact;
    }
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| keyword_matches(&tokens, w)))
        .map_or(Category::Other, |(category, _)| *category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_names_round_trip() {
        for c in Category::ALL {
            assert_eq!(normalize_category(Some(c.as_str())), c);
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
    }

    #[test]
    fn test_missing_and_blank_fall_back_to_other() {
        assert_eq!(normalize_category(None), Category::Other);
        assert_eq!(normalize_category(Some("")), Category::Other);
        assert_eq!(normalize_category(Some("   ")), Category::Other);
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        assert_eq!(normalize_category(Some("  Dairy ")), Category::Dairy);
        assert_eq!(normalize_category(Some("PRODUCE")), Category::Produce);
    }

    #[test]
    fn test_synonyms() {
        assert_eq!(normalize_category(Some("Milk & Cheese")), Category::Dairy);
        assert_eq!(normalize_category(Some("veg")), Category::Produce);
        assert_eq!(normalize_category(Some("Fresh Fruit")), Category::Produce);
        assert_eq!(normalize_category(Some("Canned goods")), Category::Pantry);
        assert_eq!(normalize_category(Some("Poultry")), Category::Meat);
        assert_eq!(normalize_category(Some("Drinks")), Category::Beverages);
    }

    #[test]
    fn test_specific_bucket_wins_over_broad() {
        assert_eq!(normalize_category(Some("frozen vegetables")), Category::Frozen);
        assert_eq!(normalize_category(Some("frozen fish")), Category::Frozen);
    }

    #[test]
    fn test_keywords_do_not_match_inside_words() {
        assert_eq!(normalize_category(Some("Steak")), Category::Meat);
        assert_eq!(normalize_category(Some("Eggplant")), Category::Produce);
        assert_eq!(normalize_category(Some("Watermelon")), Category::Produce);
        assert_eq!(normalize_category(Some("Aluminium foil")), Category::Household);
        assert_eq!(normalize_category(Some("Boiled sweets")), Category::Snacks);
        assert_eq!(normalize_category(Some("Teriyaki")), Category::Other);
    }

    #[test]
    fn test_plurals_and_phrases() {
        assert_eq!(normalize_category(Some("Eggs")), Category::Dairy);
        assert_eq!(normalize_category(Some("Pastries")), Category::Bakery);
        assert_eq!(normalize_category(Some("Toiletries")), Category::Household);
        assert_eq!(normalize_category(Some("Sauces & Oils")), Category::Pantry);
        assert_eq!(normalize_category(Some("Ice-cream")), Category::Frozen);
        assert_eq!(normalize_category(Some("Dry goods")), Category::Pantry);
        assert_eq!(normalize_category(Some("Grains")), Category::Pantry);
    }

    #[test]
    fn test_unknown_is_other() {
        assert_eq!(normalize_category(Some("miscellaneous")), Category::Other);
        assert_eq!(normalize_category(Some("garden center")), Category::Other);
    }

    #[test]
    fn test_parse_rejects_non_canonical() {
        assert_eq!(Category::parse("Dairy"), None);
        assert_eq!(Category::parse("veg"), None);
    }
}
