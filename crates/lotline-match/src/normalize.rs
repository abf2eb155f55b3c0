//! Canonicalization of free-text strings into comparable forms.
//!
//! All functions are pure, never fail, and normalize empty/blank input to the
//! empty string. Callers must treat an empty normalized query as "no match"
//! rather than comparing two empty strings.

/// Street-type and directional synonyms. Both the long and the dotted short
/// form collapse onto the abbreviation so either spelling compares equal.
const STREET_SYNONYMS: &[(&str, &str)] = &[
    ("avenue", "ave"),
    ("street", "st"),
    ("drive", "dr"),
    ("road", "rd"),
    ("boulevard", "blvd"),
    ("crescent", "cres"),
    ("place", "pl"),
    ("court", "crt"),
    ("lane", "ln"),
    ("terrace", "terr"),
    ("parkway", "pkwy"),
    ("highway", "hwy"),
    ("circle", "cir"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
];

/// City/region/country tokens stripped from addresses before comparison.
const REGION_TOKENS: &[&str] = &["saskatoon", "saskatchewan", "sk", "canada"];

/// Legal-entity suffixes removed from company names as whole words.
const COMPANY_SUFFIXES: &[&str] = &[
    "inc",
    "ltd",
    "corp",
    "corporation",
    "co",
    "llc",
    "llp",
    "lp",
    "partnership",
    "holding",
    "holdings",
    "group",
    "properties",
    "investment",
    "investments",
    "realty",
    "trust",
    "associate",
    "associates",
    "enterprise",
    "enterprises",
    "development",
    "developments",
    "construction",
];

/// Unit/suite markers stripped only by the aggressive address variant. The
/// bare `#NN` form is removed before tokenizing, since punctuation folding
/// would otherwise leave the digits behind as a plain token.
const UNIT_MARKERS: &[&str] = &["unit", "suite", "apt", "apartment"];

fn strip_hash_units(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '#' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                chars.next();
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn to_space_separated_tokens(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn street_synonym(token: &str) -> &str {
    for (long, short) in STREET_SYNONYMS {
        if token == *long || token == *short {
            return short;
        }
    }
    token
}

/// Matches a pattern like "ldl" (letter-digit-letter) against a token.
fn matches_shape(token: &str, shape: &str) -> bool {
    if token.len() != shape.len() {
        return false;
    }
    token.chars().zip(shape.chars()).all(|(c, s)| match s {
        'l' => c.is_ascii_alphabetic(),
        'd' => c.is_ascii_digit(),
        _ => false,
    })
}

fn is_postal_half_a(token: &str) -> bool {
    matches_shape(token, "ldl")
}

fn is_postal_half_b(token: &str) -> bool {
    matches_shape(token, "dld")
}

fn is_fused_postal(token: &str) -> bool {
    matches_shape(token, "ldldld")
}

/// Canonicalize a civic address for comparison.
///
/// Lowercases, collapses punctuation and whitespace, strips region/country
/// tokens and Canadian postal codes, and folds street-type and directional
/// words onto fixed abbreviations.
pub fn normalize_address(input: &str) -> String {
    let tokens = to_space_separated_tokens(input);
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut skip_next = false;

    for (i, token) in tokens.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if REGION_TOKENS.contains(&token.as_str()) || is_fused_postal(token) {
            continue;
        }
        if is_postal_half_a(token)
            && tokens
                .get(i + 1)
                .is_some_and(|next| is_postal_half_b(next))
        {
            skip_next = true;
            continue;
        }
        out.push(street_synonym(token));
    }

    out.join(" ")
}

/// Lossy variant of [`normalize_address`]: additionally strips unit/suite
/// markers (`unit NNN`, `suite NNN`, `#NNN`) and removes every remaining
/// non-alphanumeric character.
///
/// Used only as a secondary match tier: it can conflate a building with one
/// of its sub-units.
pub fn normalize_address_aggressive(input: &str) -> String {
    let base = normalize_address(&strip_hash_units(input));
    let tokens: Vec<&str> = base.split_whitespace().collect();
    let mut out = String::new();
    let mut skip_next = false;

    for (i, token) in tokens.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if UNIT_MARKERS.contains(token) {
            if tokens
                .get(i + 1)
                .is_some_and(|next| next.chars().all(|c| c.is_ascii_digit()))
            {
                skip_next = true;
            }
            continue;
        }
        out.push_str(token);
    }

    out
}

/// Canonicalize a company name: lowercase, strip punctuation, and drop
/// legal-entity suffixes as whole-word removals.
pub fn normalize_company(input: &str) -> String {
    to_space_separated_tokens(input)
        .into_iter()
        .filter(|token| !COMPANY_SUFFIXES.contains(&token.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonicalize a person name: lowercase, strip punctuation, and sort the
/// name tokens so "Jane Smith" and "Smith Jane" compare equal.
pub fn normalize_person(input: &str) -> String {
    let mut tokens = to_space_separated_tokens(input);
    tokens.sort();
    tokens.join(" ")
}
