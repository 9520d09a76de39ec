use clap::Args;
use std::path::PathBuf;

use trip_adapter::mapping::MappingRuleset;
use trip_adapter::models::CollectionKind;
use trip_adapter::normalize::NormalizationRuleset;

#[derive(Args)]
pub struct CheckRulesCommand {
    /// Rule document to check
    pub file: PathBuf,

    /// Treat the document as normalization rules instead of a mapping
    #[arg(long)]
    pub normalization: bool,

    /// Only check this sub-ruleset (e.g. trip_ticket)
    #[arg(long)]
    pub sub: Option<String>,
}

impl CheckRulesCommand {
    pub fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let checked = if self.normalization {
            let rules = NormalizationRuleset::load(&self.file)?;
            let subs = self.subs(|name| rules.has_sub(name));
            subs.into_iter()
                .map(|sub| rules.validate(sub.as_deref()).map(|count| (sub, count)))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let rules = MappingRuleset::load(&self.file)?;
            let subs = self.subs(|name| rules.has_sub(name));
            subs.into_iter()
                .map(|sub| rules.validate(sub.as_deref()).map(|count| (sub, count)))
                .collect::<Result<Vec<_>, _>>()?
        };

        for (sub, count) in checked {
            match sub {
                Some(name) => println!("{}: {} rules OK", name, count),
                None => println!("{} rules OK", count),
            }
        }
        Ok(())
    }

    /// The requested sub-ruleset, every collection sub-ruleset present, or the whole document.
    fn subs(&self, has_sub: impl Fn(&str) -> bool) -> Vec<Option<String>> {
        if let Some(sub) = &self.sub {
            return vec![Some(sub.clone())];
        }
        let present: Vec<Option<String>> = CollectionKind::ALL
            .into_iter()
            .map(CollectionKind::ruleset_name)
            .filter(|name| has_sub(name))
            .map(|name| Some(name.to_string()))
            .collect();
        if present.is_empty() {
            vec![None]
        } else {
            present
        }
    }
}
