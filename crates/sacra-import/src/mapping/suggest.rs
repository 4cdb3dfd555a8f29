//! Keyword rules that suggest a mapping from detected source columns

use serde::{Deserialize, Serialize};

use super::FieldMapping;
use crate::models::RecordType;
use crate::records::FieldKind;

/// Maps a source column to `target` when its folded name contains every keyword
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionRule {
    pub keywords: Vec<String>,
    pub target: String,
}

impl SuggestionRule {
    pub fn new(keywords: &[&str], target: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            target: target.to_string(),
        }
    }

    fn matches(&self, folded: &str) -> bool {
        !self.keywords.is_empty() && self.keywords.iter().all(|k| folded.contains(k.as_str()))
    }
}

/// Ordered rule tables per record type; the first matching rule wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionRules {
    pub baptisms: Vec<SuggestionRule>,
    pub marriages: Vec<SuggestionRule>,
    pub funerals: Vec<SuggestionRule>,
}

fn rules(table: &[(&[&str], &str)]) -> Vec<SuggestionRule> {
    table.iter().map(|(k, t)| SuggestionRule::new(k, t)).collect()
}

const REGISTER_RULES: &[(&[&str], &str)] = &[
    (&["priest"], "officiant_name"),
    (&["officiant"], "officiant_name"),
    (&["celebrant"], "officiant_name"),
    (&["minister"], "officiant_name"),
    (&["clergy"], "officiant_name"),
    (&["certificate"], "certificate_no"),
    (&["cert"], "certificate_no"),
    (&["book"], "book_no"),
    (&["page"], "page_no"),
    (&["entry"], "entry_no"),
    (&["place"], "place_name"),
    (&["parish"], "place_name"),
    (&["note"], "notes"),
    (&["remark"], "notes"),
    (&["comment"], "notes"),
    (&["record", "id"], "source_row_id"),
    (&["row", "id"], "source_row_id"),
];

impl Default for SuggestionRules {
    fn default() -> Self {
        let mut baptisms = rules(&[
            (&["godparent"], "godparents"),
            (&["godfather"], "godparents"),
            (&["godmother"], "godparents"),
            (&["sponsor"], "godparents"),
            (&["father"], "father_name"),
            (&["mother"], "mother_name"),
            (&["first"], "person_first"),
            (&["given"], "person_first"),
            (&["middle"], "person_middle"),
            (&["last"], "person_last"),
            (&["surname"], "person_last"),
            (&["family", "name"], "person_last"),
            (&["birth", "place"], "place_name"),
            (&["birth"], "birth_date"),
            (&["born"], "birth_date"),
            (&["dob"], "birth_date"),
            (&["baptism", "date"], "baptism_date"),
            (&["baptized"], "baptism_date"),
            (&["baptised"], "baptism_date"),
            (&["date"], "baptism_date"),
        ]);
        baptisms.extend(rules(REGISTER_RULES));
        baptisms.push(SuggestionRule::new(&["name"], "person_first"));

        let mut marriages = rules(&[
            (&["witness"], "witnesses"),
            (&["groom", "first"], "groom_first"),
            (&["groom", "middle"], "groom_middle"),
            (&["groom", "last"], "groom_last"),
            (&["groom", "surname"], "groom_last"),
            (&["groom"], "groom_first"),
            (&["husband"], "groom_first"),
            (&["bride", "first"], "bride_first"),
            (&["bride", "middle"], "bride_middle"),
            (&["bride", "last"], "bride_last"),
            (&["bride", "surname"], "bride_last"),
            (&["bride"], "bride_first"),
            (&["wife"], "bride_first"),
            (&["marriage", "date"], "marriage_date"),
            (&["wedding"], "marriage_date"),
            (&["married"], "marriage_date"),
            (&["date"], "marriage_date"),
        ]);
        marriages.extend(rules(REGISTER_RULES));

        let mut funerals = rules(&[
            (&["cause"], "cause_of_death"),
            (&["first"], "deceased_first"),
            (&["given"], "deceased_first"),
            (&["middle"], "deceased_middle"),
            (&["last"], "deceased_last"),
            (&["surname"], "deceased_last"),
            (&["burial", "date"], "funeral_date"),
            (&["funeral"], "funeral_date"),
            (&["burial"], "burial_place"),
            (&["cemetery"], "burial_place"),
            (&["interment"], "burial_place"),
            (&["birth"], "birth_date"),
            (&["born"], "birth_date"),
            (&["death"], "death_date"),
            (&["died"], "death_date"),
            (&["date"], "funeral_date"),
        ]);
        funerals.extend(rules(REGISTER_RULES));
        funerals.push(SuggestionRule::new(&["deceased"], "deceased_first"));
        funerals.push(SuggestionRule::new(&["name"], "deceased_first"));

        Self {
            baptisms,
            marriages,
            funerals,
        }
    }
}

/// Lowercase and drop everything but letters and digits
fn fold(column: &str) -> String {
    column
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl SuggestionRules {
    pub fn for_type(&self, record_type: RecordType) -> &[SuggestionRule] {
        match record_type {
            RecordType::Baptisms => &self.baptisms,
            RecordType::Marriages => &self.marriages,
            RecordType::Funerals => &self.funerals,
        }
    }

    /// Suggest a mapping for the given source columns. A text or date field
    /// takes the first column that matches it; list fields take all of them.
    pub fn suggest<'a, I>(&self, record_type: RecordType, columns: I) -> FieldMapping
    where
        I: IntoIterator<Item = &'a str>,
    {
        let rules = self.for_type(record_type);
        let mut mapping = FieldMapping::new();

        for column in columns {
            let folded = fold(column);
            let Some(rule) = rules.iter().find(|r| r.matches(&folded)) else {
                continue;
            };
            let Some(spec) = record_type.field(&rule.target) else {
                continue;
            };
            let taken = !mapping.sources(spec.name).is_empty();
            if taken && spec.kind != FieldKind::List {
                continue;
            }
            mapping = mapping.map(column, spec.name);
        }

        mapping
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_baptism_suggestions() {
        let rules = SuggestionRules::default();
        let mapping = rules.suggest(
            RecordType::Baptisms,
            [
                "First Name",
                "Last Name",
                "Date of Birth",
                "Baptism Date",
                "Priest",
                "Godparent 1",
                "Godparent 2",
                "Father",
                "Book No",
                "Page",
                "Entry #",
                "Notes",
                "Favourite colour",
            ],
        );
        assert_eq!(mapping.sources("person_first"), ["First Name".to_string()]);
        assert_eq!(mapping.sources("person_last"), ["Last Name".to_string()]);
        assert_eq!(mapping.sources("birth_date"), ["Date of Birth".to_string()]);
        assert_eq!(mapping.sources("baptism_date"), ["Baptism Date".to_string()]);
        assert_eq!(mapping.sources("officiant_name"), ["Priest".to_string()]);
        assert_eq!(
            mapping.sources("godparents"),
            ["Godparent 1".to_string(), "Godparent 2".to_string()]
        );
        assert_eq!(mapping.sources("father_name"), ["Father".to_string()]);
        assert_eq!(mapping.sources("entry_no"), ["Entry #".to_string()]);
        assert!(mapping.targets().all(|(_, sources)| !sources.contains(&"Favourite colour".to_string())));
    }

    #[test]
    fn test_marriage_and_funeral_suggestions() {
        let rules = SuggestionRules::default();
        let marriage = rules.suggest(RecordType::Marriages, ["Groom First", "Bride Surname", "Wedding Date", "Witness A"]);
        assert_eq!(marriage.sources("groom_first"), ["Groom First".to_string()]);
        assert_eq!(marriage.sources("bride_last"), ["Bride Surname".to_string()]);
        assert_eq!(marriage.sources("marriage_date"), ["Wedding Date".to_string()]);
        assert_eq!(marriage.sources("witnesses"), ["Witness A".to_string()]);

        let funeral = rules.suggest(RecordType::Funerals, ["Deceased", "Date of Death", "Cause of Death", "Cemetery"]);
        assert_eq!(funeral.sources("deceased_first"), ["Deceased".to_string()]);
        assert_eq!(funeral.sources("death_date"), ["Date of Death".to_string()]);
        assert_eq!(funeral.sources("cause_of_death"), ["Cause of Death".to_string()]);
        assert_eq!(funeral.sources("burial_place"), ["Cemetery".to_string()]);
    }

    #[test]
    fn test_text_field_takes_first_match_only() {
        let rules = SuggestionRules::default();
        let mapping = rules.suggest(RecordType::Baptisms, ["Date", "Other Date"]);
        assert_eq!(mapping.sources("baptism_date"), ["Date".to_string()]);
    }

    #[test]
    fn test_custom_rules() {
        let rules = SuggestionRules {
            baptisms: vec![SuggestionRule::new(&["vorname"], "person_first")],
            marriages: vec![],
            funerals: vec![],
        };
        let mapping = rules.suggest(RecordType::Baptisms, ["Vorname", "First Name"]);
        assert_eq!(mapping.sources("person_first"), ["Vorname".to_string()]);
    }
}
