/// Meter registry for the Afterbay forecast & alert service.
///
/// Defines the canonical roster of historian meters pulled every tick, the
/// forecast-only meters, the naming rules that place a meter in the
/// historian's element tree, and the closed set of alarm-monitored
/// quantities. This is the single source of truth for meter identities:
/// other modules reference the constants here rather than building column
/// names from strings.

use crate::model::{MeterSeries, SourceDatabase};

// ---------------------------------------------------------------------------
// Meter constants
// ---------------------------------------------------------------------------

/// Middle Fork flow below Interbay (upstream gauge).
pub const R4_FLOW: MeterSeries = MeterSeries::new(SourceDatabase::Ops, Some("R4"), "Flow");
/// Rubicon below the Ralston confluence (farthest gauge).
pub const R11_FLOW: MeterSeries = MeterSeries::new(SourceDatabase::Ops, Some("R11"), "Flow");
/// Rubicon River at Ralston Afterbay inflow.
pub const R30_FLOW: MeterSeries = MeterSeries::new(SourceDatabase::Ops, Some("R30"), "Flow");
/// Fixed valve release below the upstream impoundment.
pub const R5_FLOW: MeterSeries = MeterSeries::new(SourceDatabase::Ops, Some("R5"), "Flow");
pub const AFTERBAY_ELEVATION: MeterSeries =
    MeterSeries::new(SourceDatabase::Ops, Some("Afterbay"), "Elevation");
/// Float level: the operator-set ceiling on the Afterbay.
pub const AFTERBAY_SETPOINT: MeterSeries =
    MeterSeries::new(SourceDatabase::Ops, Some("Afterbay"), "Elevation Setpoint");
pub const HELL_HOLE_ELEVATION: MeterSeries =
    MeterSeries::new(SourceDatabase::Ops, Some("Hell Hole"), "Elevation");
/// Observed downstream generation (MW).
pub const OXBOW_POWER: MeterSeries = MeterSeries::new(SourceDatabase::Ops, Some("Oxbow"), "Power");
/// Observed combined Middle Fork + Ralston generation (MW).
pub const GEN_MDFK_AND_RA: MeterSeries =
    MeterSeries::new(SourceDatabase::EnergyMarketing, None, "GEN_MDFK_and_RA");
/// Scheduled combined Middle Fork + Ralston generation (MW).
pub const ADS_MDFK_AND_RA: MeterSeries =
    MeterSeries::new(SourceDatabase::EnergyMarketing, None, "ADS_MDFK_and_RA");
/// Scheduled downstream generation (MW).
pub const ADS_OXBOW: MeterSeries = MeterSeries::new(SourceDatabase::EnergyMarketing, None, "ADS_Oxbow");

/// 72-hour downstream plant generation forecast.
pub const OXBOW_FORECAST: MeterSeries =
    MeterSeries::new(SourceDatabase::Ops, Some("Oxbow"), "Forecasted Generation");
/// 72-hour combined Middle Fork + Ralston generation forecast tag.
pub const MFRA_FORECAST: MeterSeries =
    MeterSeries::new(SourceDatabase::EnergyMarketing, None, "MFRA_Forecast");

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// A roster entry: the meter plus why it is pulled.
#[derive(Debug)]
pub struct MeterEntry {
    pub meter: MeterSeries,
    pub unit: &'static str,
    pub description: &'static str,
}

/// Every meter fetched on each polling tick. The water-balance model needs
/// all of them simultaneously, so unification fails if any comes back empty.
pub static METER_ROSTER: &[MeterEntry] = &[
    MeterEntry {
        meter: R4_FLOW,
        unit: "cfs",
        description: "Middle Fork below Interbay; feeds spill into the Afterbay \
                      and drives Pmin/Pmax.",
    },
    MeterEntry {
        meter: R11_FLOW,
        unit: "cfs",
        description: "Rubicon gauge monitored for user flow alarms.",
    },
    MeterEntry {
        meter: R30_FLOW,
        unit: "cfs",
        description: "Rubicon inflow to the Afterbay.",
    },
    MeterEntry {
        meter: AFTERBAY_ELEVATION,
        unit: "ft",
        description: "Afterbay water surface; starting point of the storage \
                      recursion and reference for bias correction.",
    },
    MeterEntry {
        meter: AFTERBAY_SETPOINT,
        unit: "ft",
        description: "Float level; ceiling on forecast elevation and source of \
                      float-change alarms.",
    },
    MeterEntry {
        meter: OXBOW_POWER,
        unit: "MW",
        description: "Observed Oxbow generation; overrides forecast outflow for \
                      hours already observed.",
    },
    MeterEntry {
        meter: R5_FLOW,
        unit: "cfs",
        description: "Valve release below Hell Hole; Pmin/Pmax input.",
    },
    MeterEntry {
        meter: HELL_HOLE_ELEVATION,
        unit: "ft",
        description: "Hell Hole elevation; scales the second Pmin term.",
    },
    MeterEntry {
        meter: GEN_MDFK_AND_RA,
        unit: "MW",
        description: "Observed combined Middle Fork + Ralston generation.",
    },
    MeterEntry {
        meter: ADS_MDFK_AND_RA,
        unit: "MW",
        description: "Scheduled combined Middle Fork + Ralston generation.",
    },
    MeterEntry {
        meter: ADS_OXBOW,
        unit: "MW",
        description: "Scheduled Oxbow generation; compared to observed for the \
                      deviation alarm.",
    },
];

/// Meters of the roster, in fetch order.
pub fn roster() -> Vec<MeterSeries> {
    METER_ROSTER.iter().map(|e| e.meter).collect()
}

/// Looks up a roster entry by canonical column key.
pub fn find_meter(column_key: &str) -> Option<&'static MeterEntry> {
    METER_ROSTER.iter().find(|e| e.meter.column_key() == column_key)
}

// ---------------------------------------------------------------------------
// Element-tree naming rules
// ---------------------------------------------------------------------------

/// Station-name fragments that identify a reservoir element.
pub const RESERVOIR_TOKENS: &[&str] = &["Afterbay", "Hell Hole"];
/// Station-name fragments that identify a generation-unit element.
pub const PLANT_TOKENS: &[&str] = &["Middle Fork", "Oxbow"];

/// Structural category of a meter in the historian's operations database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    GaugingStation,
    Reservoir,
    GenerationUnit,
}

impl ElementType {
    /// Folder name in the historian element tree.
    pub fn path_name(&self) -> &'static str {
        match self {
            ElementType::GaugingStation => "Gauging Stations",
            ElementType::Reservoir => "Reservoirs",
            ElementType::GenerationUnit => "Generation Units",
        }
    }

    /// Resolves the element category from naming rules, in priority order:
    /// a `Flow` attribute is always a gauging station, then reservoir
    /// tokens, then plant tokens. Returns `None` for station-less meters and
    /// names that match no rule.
    pub fn resolve(meter: &MeterSeries) -> Option<ElementType> {
        let station = meter.station?;
        if meter.attribute == "Flow" {
            return Some(ElementType::GaugingStation);
        }
        if RESERVOIR_TOKENS.iter().any(|t| station.contains(t)) {
            return Some(ElementType::Reservoir);
        }
        if PLANT_TOKENS.iter().any(|t| station.contains(t)) {
            return Some(ElementType::GenerationUnit);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Alarm-monitored quantities
// ---------------------------------------------------------------------------

/// Closed set of quantities users can set alarms on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quantity {
    R4Flow,
    R11Flow,
    R30Flow,
    AfterbayElevation,
}

impl Quantity {
    pub const ALL: [Quantity; 4] = [
        Quantity::R4Flow,
        Quantity::R11Flow,
        Quantity::R30Flow,
        Quantity::AfterbayElevation,
    ];

    pub fn meter(&self) -> MeterSeries {
        match self {
            Quantity::R4Flow => R4_FLOW,
            Quantity::R11Flow => R11_FLOW,
            Quantity::R30Flow => R30_FLOW,
            Quantity::AfterbayElevation => AFTERBAY_ELEVATION,
        }
    }

    /// Prefix of the trigger keys (`r4` → `r4_hi` / `r4_lo`).
    pub fn trigger_prefix(&self) -> &'static str {
        match self {
            Quantity::R4Flow => "r4",
            Quantity::R11Flow => "r11",
            Quantity::R30Flow => "r30",
            Quantity::AfterbayElevation => "afterbay",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::AfterbayElevation => "ft",
            _ => "cfs",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
