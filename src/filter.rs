//! Per-session spot filters.
//!
//! Every telnet session owns a filter. All predicates default to allow-all;
//! adding the first entry to a whitelist activates it, removing the last
//! entry resets it back to allow-all. A spot matches only when every active
//! predicate matches.

use std::collections::HashSet;
use std::fmt;

use crate::spot::{SourceType, Spot};

/// Whitelist-style predicate set for one telnet session.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    modes: HashSet<String>,
    bands: HashSet<String>,
    dx_continents: HashSet<String>,
    de_continents: HashSet<String>,
    dx_zones: HashSet<u16>,
    de_zones: HashSet<u16>,
    dx_grid2: HashSet<String>,
    de_grid2: HashSet<String>,
    sources: HashSet<SourceType>,
    require_human: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A filter pre-seeded with a mode whitelist (server-wide default mode
    /// selection); empty input keeps the permissive default.
    pub fn with_default_modes(modes: &[String]) -> Self {
        let mut f = Self::new();
        for mode in modes {
            f.set_mode(mode, true);
        }
        f
    }

    pub fn set_mode(&mut self, mode: &str, enabled: bool) {
        set_entry(&mut self.modes, mode.trim().to_ascii_uppercase(), enabled);
    }

    pub fn set_band(&mut self, band: &str, enabled: bool) {
        set_entry(&mut self.bands, band.trim().to_ascii_lowercase(), enabled);
    }

    pub fn set_dx_continent(&mut self, continent: &str, enabled: bool) {
        set_entry(&mut self.dx_continents, continent.trim().to_ascii_uppercase(), enabled);
    }

    pub fn set_de_continent(&mut self, continent: &str, enabled: bool) {
        set_entry(&mut self.de_continents, continent.trim().to_ascii_uppercase(), enabled);
    }

    pub fn set_dx_zone(&mut self, zone: u16, enabled: bool) {
        if enabled {
            self.dx_zones.insert(zone);
        } else {
            self.dx_zones.remove(&zone);
        }
    }

    pub fn set_de_zone(&mut self, zone: u16, enabled: bool) {
        if enabled {
            self.de_zones.insert(zone);
        } else {
            self.de_zones.remove(&zone);
        }
    }

    /// Grid whitelists hold 2-character fields; longer arguments are
    /// truncated to their field.
    pub fn set_dx_grid2(&mut self, grid: &str, enabled: bool) {
        set_entry(&mut self.dx_grid2, grid_field(grid), enabled);
    }

    pub fn set_de_grid2(&mut self, grid: &str, enabled: bool) {
        set_entry(&mut self.de_grid2, grid_field(grid), enabled);
    }

    pub fn set_source(&mut self, source: SourceType, enabled: bool) {
        if enabled {
            self.sources.insert(source);
        } else {
            self.sources.remove(&source);
        }
    }

    pub fn set_require_human(&mut self, required: bool) {
        self.require_human = required;
    }

    /// Reset every predicate to allow-all.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn all_dx_grid2(&self) -> bool {
        self.dx_grid2.is_empty()
    }

    pub fn all_de_grid2(&self) -> bool {
        self.de_grid2.is_empty()
    }

    /// A spot matches iff every active predicate matches; inactive
    /// predicates are transparent.
    pub fn matches(&self, spot: &Spot) -> bool {
        if !self.modes.is_empty() && !self.modes.contains(&spot.mode.to_ascii_uppercase()) {
            return false;
        }
        if !self.bands.is_empty() {
            match spot.band() {
                Some(band) if self.bands.contains(band) => {}
                _ => return false,
            }
        }
        if !matches_whitelist(&self.dx_continents, &spot.dx_metadata.continent) {
            return false;
        }
        if !matches_whitelist(&self.de_continents, &spot.de_metadata.continent) {
            return false;
        }
        if !self.dx_zones.is_empty() && !self.dx_zones.contains(&spot.dx_metadata.cq_zone) {
            return false;
        }
        if !self.de_zones.is_empty() && !self.de_zones.contains(&spot.de_metadata.cq_zone) {
            return false;
        }
        if !matches_grid2(&self.dx_grid2, &spot.dx_metadata.grid) {
            return false;
        }
        if !matches_grid2(&self.de_grid2, &spot.de_metadata.grid) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&spot.source) {
            return false;
        }
        if self.require_human && !spot.is_human {
            return false;
        }
        true
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, set: &HashSet<T>) -> fmt::Result {
            let rendered = if set.is_empty() {
                "ALL".to_string()
            } else {
                let mut items: Vec<String> = set.iter().map(|v| v.to_string()).collect();
                items.sort();
                items.join(",")
            };
            writeln!(f, "  {name:<8} {rendered}")
        }
        show(f, "MODE", &self.modes)?;
        show(f, "BAND", &self.bands)?;
        show(f, "DXCONT", &self.dx_continents)?;
        show(f, "DECONT", &self.de_continents)?;
        show(f, "DXZONE", &self.dx_zones)?;
        show(f, "DEZONE", &self.de_zones)?;
        show(f, "DXGRID2", &self.dx_grid2)?;
        show(f, "DEGRID2", &self.de_grid2)?;
        show(f, "SOURCE", &self.sources)?;
        write!(f, "  {:<8} {}", "HUMAN", if self.require_human { "ON" } else { "OFF" })
    }
}

fn set_entry(set: &mut HashSet<String>, value: String, enabled: bool) {
    if value.is_empty() {
        return;
    }
    if enabled {
        set.insert(value);
    } else {
        set.remove(&value);
    }
}

fn grid_field(grid: &str) -> String {
    let upper = grid.trim().to_ascii_uppercase();
    upper.chars().take(2).collect()
}

fn matches_whitelist(set: &HashSet<String>, value: &str) -> bool {
    if set.is_empty() {
        return true;
    }
    !value.is_empty() && set.contains(&value.to_ascii_uppercase())
}

/// An active grid whitelist rejects spots whose grid is missing; otherwise
/// the spot's 2-character field must be whitelisted.
fn matches_grid2(set: &HashSet<String>, grid: &str) -> bool {
    if set.is_empty() {
        return true;
    }
    let field = grid_field(grid);
    if field.len() < 2 {
        return false;
    }
    set.contains(&field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::CallMetadata;

    fn make_spot() -> Spot {
        let mut s = Spot::new("G4ABC", "K3LR-#", 14025.0, "CW");
        s.source = SourceType::Rbn;
        s.is_human = false;
        s.dx_metadata = CallMetadata {
            continent: "EU".into(),
            country: "England".into(),
            cq_zone: 14,
            itu_zone: 27,
            grid: "IO91".into(),
            adif: 223,
        };
        s.de_metadata = CallMetadata {
            continent: "NA".into(),
            country: "United States".into(),
            cq_zone: 5,
            itu_zone: 8,
            grid: "EN91".into(),
            adif: 291,
        };
        s
    }

    #[test]
    fn test_default_filter_allows_everything() {
        let f = Filter::new();
        assert!(f.matches(&make_spot()));
    }

    #[test]
    fn test_mode_whitelist() {
        let mut f = Filter::new();
        f.set_mode("cw", true);
        assert!(f.matches(&make_spot()));

        let mut ft8 = make_spot();
        ft8.mode = "FT8".to_string();
        assert!(!f.matches(&ft8));

        f.set_mode("FT8", true);
        assert!(f.matches(&ft8));
    }

    #[test]
    fn test_band_whitelist() {
        let mut f = Filter::new();
        f.set_band("20m", true);
        f.set_band("40m", true);
        assert!(f.matches(&make_spot()));

        let mut s = make_spot();
        s.frequency_khz = 21025.0;
        assert!(!f.matches(&s));

        // No recognized band at all is rejected by an active band filter.
        s.frequency_khz = 4500.0;
        assert!(!f.matches(&s));
    }

    #[test]
    fn test_continent_whitelist_rejects_missing() {
        let mut f = Filter::new();
        f.set_dx_continent("EU", true);
        assert!(f.matches(&make_spot()));

        let mut s = make_spot();
        s.dx_metadata.continent = "NA".into();
        assert!(!f.matches(&s));

        s.dx_metadata.continent = String::new();
        assert!(!f.matches(&s));
    }

    #[test]
    fn test_zone_whitelist_rejects_missing() {
        let mut f = Filter::new();
        f.set_dx_zone(14, true);
        assert!(f.matches(&make_spot()));

        let mut s = make_spot();
        s.dx_metadata.cq_zone = 15;
        assert!(!f.matches(&s));

        s.dx_metadata.cq_zone = 0;
        assert!(!f.matches(&s));
    }

    #[test]
    fn test_grid2_prefix_matching() {
        let mut f = Filter::new();
        f.set_dx_grid2("IO91", true); // truncated to IO
        assert!(!f.all_dx_grid2());

        assert!(f.matches(&make_spot()));

        let mut s = make_spot();
        s.dx_metadata.grid = "KN44".into();
        assert!(!f.matches(&s));

        s.dx_metadata.grid = String::new();
        assert!(!f.matches(&s), "missing grid rejected while filter active");

        // DE grid untouched by the DX whitelist.
        let mut s = make_spot();
        s.de_metadata.grid = "ZZ99".into();
        assert!(f.matches(&s));
    }

    #[test]
    fn test_grid2_removing_last_entry_resets_to_all() {
        let mut f = Filter::new();
        f.set_dx_grid2("FN", true);
        f.set_dx_grid2("KN", true);
        f.set_dx_grid2("KN", false);
        assert!(!f.all_dx_grid2(), "filter stays active with one entry left");

        f.set_dx_grid2("FN", false);
        assert!(f.all_dx_grid2(), "filter resets to ALL after last removal");

        f.set_de_grid2("FN", true);
        f.set_de_grid2("FN", false);
        assert!(f.all_de_grid2());
    }

    #[test]
    fn test_source_and_human_predicates() {
        let mut f = Filter::new();
        f.set_source(SourceType::PskReporter, true);
        assert!(!f.matches(&make_spot()));
        f.set_source(SourceType::Rbn, true);
        assert!(f.matches(&make_spot()));

        let mut f = Filter::new();
        f.set_require_human(true);
        assert!(!f.matches(&make_spot()));
        let mut human = make_spot();
        human.source = SourceType::Upstream;
        human.is_human = true;
        assert!(f.matches(&human));
    }

    #[test]
    fn test_clear_restores_permissive_defaults() {
        let mut f = Filter::new();
        f.set_mode("CW", true);
        f.set_dx_zone(14, true);
        f.set_require_human(true);
        f.clear();
        let mut s = make_spot();
        s.mode = "FT8".into();
        s.dx_metadata.cq_zone = 40;
        assert!(f.matches(&s));
    }

    #[test]
    fn test_default_mode_selection() {
        let f = Filter::with_default_modes(&["CW".to_string(), "RTTY".to_string()]);
        assert!(f.matches(&make_spot()));
        let mut s = make_spot();
        s.mode = "USB".into();
        assert!(!f.matches(&s));

        let permissive = Filter::with_default_modes(&[]);
        assert!(permissive.matches(&s));
    }
}
