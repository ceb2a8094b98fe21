//! Institution-name canonicalization.
//!
//! The same institution is spelled differently across filing types and
//! years (legal-form prefixes, `LIMITADA` vs `LTDA`, mutualists filed
//! under a bare short name). The normalizer turns every raw spelling into
//! one canonical label, which doubles as the entity identifier across the
//! consolidated datasets.

use crate::schema::Segment;
use serde::{Deserialize, Serialize};

/// Immutable canonicalization tables, loaded once and passed explicitly.
/// `Default` carries the tables known for this regulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Exact spellings (short or historical long form) of the closed set
    /// of mutualists, mapped to their canonical label. Consulted first and
    /// only in mutualist context, so a cooperative that merely starts with
    /// the same word is never captured.
    pub mutualista_aliases: Vec<(String, String)>,
    /// Institutional-type prefixes stripped from cooperative names.
    pub prefixes: Vec<String>,
    /// Manual corrections for spellings that differ between filing types
    /// for reasons no general rule covers.
    pub corrections: Vec<(String, String)>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let mutualistas = [
            ("AMBATO", "Mutualista Ambato"),
            ("AZUAY", "Mutualista Azuay"),
            ("IMBABURA", "Mutualista Imbabura"),
            ("PICHINCHA", "Mutualista Pichincha"),
        ];
        let mut mutualista_aliases = Vec::new();
        for (short, canonical) in mutualistas {
            mutualista_aliases.push((short.to_string(), canonical.to_string()));
            // Historical long legal form used in early filings.
            mutualista_aliases.push((
                format!(
                    "ASOCIACION MUTUALISTA DE AHORRO Y CREDITO PARA LA VIVIENDA {}",
                    short
                ),
                canonical.to_string(),
            ));
            mutualista_aliases.push((canonical.to_uppercase(), canonical.to_string()));
        }

        NormalizerConfig {
            mutualista_aliases,
            prefixes: vec![
                "COOPERATIVA DE AHORRO Y CREDITO ".to_string(),
                "COOPERATIVA DE AHORRO Y CRÉDITO ".to_string(),
                "COOP. DE AHORRO Y CREDITO ".to_string(),
            ],
            corrections: vec![
                (
                    "ALFONSO JARAMILLO LEON CCC".to_string(),
                    "ALFONSO JARAMILLO LEON CAJA".to_string(),
                ),
                (
                    "FERNANDO DAQUILEMA".to_string(),
                    "FERNANDO DAQUILEMA LTDA".to_string(),
                ),
                (
                    "VISION DE LOS ANDES VISANDES".to_string(),
                    "VISION DE LOS ANDES VIS ANDES".to_string(),
                ),
                (
                    "EDUCADORES DE LOJA LTDA".to_string(),
                    "EDUCADORES DE LOJA - CACEL LTDA".to_string(),
                ),
                ("SUMAK SISA".to_string(), "SISA".to_string()),
                (
                    "DE LA PEQUENA EMPRESA CACPE ZAMORA LTDA".to_string(),
                    "DE LA PEQUEÑA EMPRESA CACPE ZAMORA CHINCHIPE LTDA".to_string(),
                ),
                (
                    "CAMARA DE COMERCIO DE SANTO DOMINGO EN LIQUIDACION".to_string(),
                    "CAMARA DE COMERCIO DE SANTO DOMINGO".to_string(),
                ),
                (
                    "PARA LA VIVIENDA ORDEN Y SEGURIDAD".to_string(),
                    "ORDEN Y SEGURIDAD \"OYS\"".to_string(),
                ),
            ],
        }
    }
}

pub struct EntityNormalizer {
    config: NormalizerConfig,
}

impl EntityNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        EntityNormalizer { config }
    }

    /// Canonical label for a raw institution name. Pure and idempotent:
    /// `canonical(canonical(x)) == canonical(x)` for every input.
    pub fn canonical(&self, raw: &str, segment: Segment) -> String {
        let trimmed = raw.trim();

        // Alias hits skip every later rule.
        if segment.is_mutualista() {
            let upper = trimmed.to_uppercase();
            if let Some((_, canonical)) = self
                .config
                .mutualista_aliases
                .iter()
                .find(|(alias, _)| *alias == upper)
            {
                return canonical.clone();
            }
        }

        let mut name = trimmed.to_string();

        let upper = name.to_uppercase();
        for prefix in &self.config.prefixes {
            if upper.starts_with(prefix.as_str()) {
                name = name[prefix.len()..].trim_start().to_string();
                break;
            }
        }

        name = name.replace(" LIMITADA", " LTDA");
        if name.ends_with("LTDA.") {
            name.pop();
        }

        name = name.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some((_, replacement)) = self
            .config
            .corrections
            .iter()
            .find(|(from, _)| *from == name)
        {
            name = replacement.clone();
        }

        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> EntityNormalizer {
        EntityNormalizer::new(NormalizerConfig::default())
    }

    #[test]
    fn test_legal_suffix_unification() {
        let n = normalizer();
        assert_eq!(n.canonical("XYZ LIMITADA", Segment::One), "XYZ LTDA");
        assert_eq!(n.canonical("XYZ LTDA.", Segment::One), "XYZ LTDA");
        assert_eq!(n.canonical("XYZ LTDA", Segment::One), "XYZ LTDA");
    }

    #[test]
    fn test_prefix_stripped() {
        let n = normalizer();
        assert_eq!(
            n.canonical(
                "COOPERATIVA DE AHORRO Y CREDITO ANDINA LTDA.",
                Segment::One
            ),
            "ANDINA LTDA"
        );
        assert_eq!(
            n.canonical("COOP. DE AHORRO Y CREDITO ANDINA LIMITADA", Segment::One),
            "ANDINA LTDA"
        );
    }

    #[test]
    fn test_whitespace_collapsed() {
        let n = normalizer();
        assert_eq!(n.canonical("  JUVENTUD   ECUATORIANA  ", Segment::Two), "JUVENTUD ECUATORIANA");
    }

    #[test]
    fn test_mutualista_short_and_long_forms_converge() {
        let n = normalizer();
        let canonical = n.canonical("AMBATO", Segment::MutualistaOne);
        assert_eq!(canonical, "Mutualista Ambato");
        assert_eq!(
            n.canonical(
                "ASOCIACION MUTUALISTA DE AHORRO Y CREDITO PARA LA VIVIENDA AMBATO",
                Segment::MutualistaOne
            ),
            canonical
        );
    }

    #[test]
    fn test_prefix_sharing_cooperative_stays_distinct() {
        let n = normalizer();
        // A cooperative whose name starts with a mutualist short form must
        // not be captured by the alias table.
        assert_eq!(
            n.canonical("AMBATO EMPRENDEDORA LTDA", Segment::Three),
            "AMBATO EMPRENDEDORA LTDA"
        );
        assert_eq!(n.canonical("AMBATO", Segment::Three), "AMBATO");
    }

    #[test]
    fn test_manual_corrections() {
        let n = normalizer();
        assert_eq!(
            n.canonical("FERNANDO DAQUILEMA", Segment::One),
            "FERNANDO DAQUILEMA LTDA"
        );
        assert_eq!(
            n.canonical("SUMAK SISA", Segment::Two),
            "SISA"
        );
    }

    #[test]
    fn test_idempotence() {
        let n = normalizer();
        let inputs = [
            ("COOPERATIVA DE AHORRO Y CREDITO ANDINA LIMITADA", Segment::One),
            ("XYZ LTDA.", Segment::One),
            ("AMBATO", Segment::MutualistaOne),
            ("FERNANDO DAQUILEMA", Segment::One),
            ("CAMARA DE COMERCIO DE SANTO DOMINGO EN LIQUIDACION", Segment::Two),
            ("  PLAIN   NAME  ", Segment::Unknown),
        ];
        for (raw, segment) in inputs {
            let once = n.canonical(raw, segment);
            let twice = n.canonical(&once, segment);
            assert_eq!(once, twice, "not idempotent for '{}'", raw);
        }
    }
}
