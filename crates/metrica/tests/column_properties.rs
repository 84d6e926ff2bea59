//! Property test: any number of marriage register rows laid out under the
//! built-in column template comes back as the same rows, in order.

mod common;

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use common::marriage_ledger;
use metrica::columns::ColumnMapper;
use metrica::config::ExtractionConfig;
use metrica::layout::builtin;
use metrica::record::fields;
use metrica::tokenizer::tokenize;
use metrica::RecordType;

const GROOMS: &[&str] = &["Ivan", "Pavel", "Fyodor", "Nikolai", "Sergei", "Mikhail"];
const BRIDES: &[&str] = &["Anna", "Olga", "Maria", "Elena", "Sofia", "Varvara"];
const SURNAMES: &[&str] = &["Petrov", "Lebedev", "Sokolov", "Morozov", "Kozlov", "Volkov"];

#[derive(Debug, Clone)]
struct Entry {
    date: String,
    groom: String,
    bride: String,
    witnesses: String,
}

fn entry() -> impl Strategy<Value = Entry> {
    (
        1_u32..29,
        1_u32..13,
        1880_u32..1918,
        prop::sample::select(GROOMS),
        prop::sample::select(BRIDES),
        prop::sample::select(SURNAMES),
        prop::sample::select(SURNAMES),
        prop::sample::select(GROOMS),
    )
        .prop_map(|(day, month, year, groom, bride, surname, witness_surname, witness)| Entry {
            date: format!("{:02}.{:02}.{}", day, month, year),
            groom: format!("{} {}", groom, surname),
            bride: format!("{} {}a", bride, surname),
            witnesses: format!("{} {}", witness, witness_surname),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn rows_map_back_to_their_columns(entries in prop::collection::vec(entry(), 1..9)) {
        let numbers: Vec<String> = (1..=entries.len()).map(|n| n.to_string()).collect();
        let rows: Vec<(&str, &str, &str, &str, &str)> = entries
            .iter()
            .zip(&numbers)
            .map(|(e, n)| (n.as_str(), e.date.as_str(), e.groom.as_str(), e.bride.as_str(), e.witnesses.as_str()))
            .collect();
        let page = tokenize(&marriage_ledger(&rows), &[]);

        let template = builtin::marriage_ledger();
        let records = ColumnMapper::new(&ExtractionConfig::default())
            .map_columns(&page, RecordType::Marriage, Some(&template));

        prop_assert_eq!(records.len(), entries.len());
        for (i, (record, e)) in records.iter().zip(&entries).enumerate() {
            prop_assert_eq!(record.row_index, Some(i as u32));
            prop_assert_eq!(record.value(fields::RECORD_NUMBER), Some(numbers[i].as_str()));
            prop_assert_eq!(record.value(fields::MARRIAGE_DATE), Some(e.date.as_str()));
            prop_assert_eq!(record.value(fields::GROOM_NAME), Some(e.groom.as_str()));
            prop_assert_eq!(record.value(fields::BRIDE_NAME), Some(e.bride.as_str()));
            prop_assert_eq!(record.value(fields::WITNESSES), Some(e.witnesses.as_str()));
            prop_assert!(!record.continues_previous);
        }
    }
}
