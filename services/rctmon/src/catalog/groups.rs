//! Poll membership tables and group derivation

use std::collections::HashSet;
use std::time::Duration;

use super::objects::{
    self, GENERATOR_A_ENABLED, GENERATOR_B_ENABLED, MODULE_CYCLES, MODULE_SERIALS,
    POWER_SWITCH_AVAILABLE,
};
use crate::discovery::Inventory;
use crate::protocol::DataKind;
use crate::store::LabelSet;

/// Label every reading carries
pub const INVERTER_LABEL: &str = "inverter";

/// Cadence tier, in scheduling priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Fast,
    Slow,
    Static,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Slow, Tier::Static];

    /// Lower wins when groups are due together
    pub fn priority(self) -> u8 {
        match self {
            Tier::Fast => 0,
            Tier::Slow => 1,
            Tier::Static => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Slow => "slow",
            Tier::Static => "static",
        }
    }
}

/// Poll interval per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadences {
    pub fast: Duration,
    pub slow: Duration,
    pub static_tier: Duration,
}

impl Cadences {
    pub fn of(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Fast => self.fast,
            Tier::Slow => self.slow,
            Tier::Static => self.static_tier,
        }
    }
}

impl Default for Cadences {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(10),
            slow: Duration::from_secs(60),
            static_tier: Duration::from_secs(300),
        }
    }
}

/// Component a data point depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Always,
    GeneratorA,
    GeneratorB,
    Battery,
    PowerSwitch,
    Bms,
}

impl Capability {
    pub fn is_met(self, inventory: &Inventory) -> bool {
        match self {
            Capability::Always => true,
            Capability::GeneratorA => inventory.generator_a,
            Capability::GeneratorB => inventory.generator_b,
            Capability::Battery => inventory.battery,
            Capability::PowerSwitch => inventory.power_switch,
            Capability::Bms => inventory.bms,
        }
    }
}

/// Static membership entry
#[derive(Debug, Clone, Copy)]
pub struct PointDef {
    pub oid: u32,
    pub metric: &'static str,
    pub labels: &'static [(&'static str, &'static str)],
    pub tier: Tier,
    pub requires: Capability,
}

const fn point(
    oid: u32,
    metric: &'static str,
    labels: &'static [(&'static str, &'static str)],
    tier: Tier,
    requires: Capability,
) -> PointDef {
    PointDef {
        oid,
        metric,
        labels,
        tier,
        requires,
    }
}

/// Per-module entry expanded for every discovered battery module
#[derive(Debug, Clone, Copy)]
pub struct ModuleTemplate {
    pub oids: [u32; objects::MAX_BATTERY_MODULES],
    pub metric: &'static str,
    pub tier: Tier,
}

use Capability::*;
use Tier::*;

const L1: &[(&str, &str)] = &[("phase", "l1")];
const L2: &[(&str, &str)] = &[("phase", "l2")];
const L3: &[(&str, &str)] = &[("phase", "l3")];
const GEN_A: &[(&str, &str)] = &[("generator", "a")];
const GEN_B: &[(&str, &str)] = &[("generator", "b")];
const NONE: &[(&str, &str)] = &[];

pub static POINTS: &[PointDef] = &[
    // Inventory flags, re-read slowly so a scrape shows what was detected
    point(GENERATOR_A_ENABLED, "rctmon_inventory", &[("component", "generator_a")], Static, Always),
    point(GENERATOR_B_ENABLED, "rctmon_inventory", &[("component", "generator_b")], Static, Always),
    point(POWER_SWITCH_AVAILABLE, "rctmon_inventory", &[("component", "power_switch")], Static, Always),
    // Inverter
    point(0x5F33284E, "rctmon_inverter_status", NONE, Fast, Always),
    point(0x7924ABD9, "rctmon_inverter_info", &[("field", "serial_number")], Static, Always),
    point(0xDDD1C2D0, "rctmon_inverter_info", &[("field", "control_software_version")], Static, Always),
    point(0x68BC034D, "rctmon_inverter_info", &[("field", "parameter_file")], Static, Always),
    point(0xF79D41D9, "rctmon_temperature", &[("sensor", "heatsink")], Slow, Always),
    point(0x4F735D10, "rctmon_temperature", &[("sensor", "heatsink_battery_actuator")], Slow, Always),
    point(0xC24E85D0, "rctmon_temperature", &[("sensor", "core")], Slow, Always),
    // Household
    point(0x1AC87AA0, "rctmon_household_load_watt", NONE, Fast, Always),
    point(0x03A39CA2, "rctmon_household_load_phase_watt", L1, Fast, Always),
    point(0x2788928C, "rctmon_household_load_phase_watt", L2, Fast, Always),
    point(0xF0B436DD, "rctmon_household_load_phase_watt", L3, Fast, Always),
    // Grid
    point(0x91617C58, "rctmon_grid_power_total_watt", NONE, Fast, Always),
    point(0x27BE51D9, "rctmon_grid_power_watt", L1, Fast, Always),
    point(0xF5584F90, "rctmon_grid_power_watt", L2, Fast, Always),
    point(0xB221BCFA, "rctmon_grid_power_watt", L3, Fast, Always),
    point(0xCF053085, "rctmon_grid_voltage_volt", L1, Fast, Always),
    point(0x54B4684E, "rctmon_grid_voltage_volt", L2, Fast, Always),
    point(0x2545E22D, "rctmon_grid_voltage_volt", L3, Fast, Always),
    // Solar generator A
    point(0xB55BA2CE, "rctmon_generator_voltage_volt", GEN_A, Fast, GeneratorA),
    point(0xAA9AA253, "rctmon_generator_power_watt", GEN_A, Fast, GeneratorA),
    point(0xDB11855B, "rctmon_generator_power_lowpass_watt", GEN_A, Fast, GeneratorA),
    point(0x226A23A4, "rctmon_generator_mpp_target_voltage_volt", GEN_A, Slow, GeneratorA),
    point(0xBA8B8515, "rctmon_generator_mpp_search_step_volt", GEN_A, Slow, GeneratorA),
    // Solar generator B
    point(0xB0041187, "rctmon_generator_voltage_volt", GEN_B, Fast, GeneratorB),
    point(0x0CB5D21B, "rctmon_generator_power_lowpass_watt", GEN_B, Fast, GeneratorB),
    point(0x675776B1, "rctmon_generator_mpp_target_voltage_volt", GEN_B, Slow, GeneratorB),
    point(0x4AE96C12, "rctmon_generator_mpp_search_step_volt", GEN_B, Slow, GeneratorB),
    // Power switch
    point(0x27650FE2, "rctmon_powerswitch_software_version", NONE, Static, PowerSwitch),
    point(0x173D81E4, "rctmon_powerswitch_bootloader_version", NONE, Static, PowerSwitch),
    point(0x93F976AB, "rctmon_powerswitch_grid_voltage_volt", L1, Fast, PowerSwitch),
    point(0x7A9091EA, "rctmon_powerswitch_grid_voltage_volt", L2, Fast, PowerSwitch),
    point(0x21EE7CBB, "rctmon_powerswitch_grid_voltage_volt", L3, Fast, PowerSwitch),
    point(0x9558AD8A, "rctmon_powerswitch_grid_frequency_hertz", L1, Fast, PowerSwitch),
    point(0xFAE429C5, "rctmon_powerswitch_grid_frequency_hertz", L2, Fast, PowerSwitch),
    point(0x0104EB6A, "rctmon_powerswitch_grid_frequency_hertz", L3, Fast, PowerSwitch),
    point(0x3B5F6B9D, "rctmon_powerstorage_frequency_hertz", L1, Fast, PowerSwitch),
    point(0x6FD36B32, "rctmon_powerstorage_frequency_hertz", L2, Fast, PowerSwitch),
    point(0x905F707B, "rctmon_powerstorage_frequency_hertz", L3, Fast, PowerSwitch),
    // Battery
    point(0xA7FA5C5D, "rctmon_battery_voltage_volt", NONE, Fast, Battery),
    point(0x65EED11B, "rctmon_battery_bms_voltage_volt", NONE, Fast, Battery),
    point(0x1156DFD0, "rctmon_battery_power_watt", NONE, Fast, Battery),
    point(0x21961B58, "rctmon_battery_current", NONE, Fast, Battery),
    point(0xDC667958, "rctmon_battery_state", NONE, Fast, Battery),
    point(0x71765BD8, "rctmon_battery_status", NONE, Fast, Battery),
    point(0x0DE3D20D, "rctmon_battery_status2", NONE, Fast, Battery),
    point(0x959930BF, "rctmon_battery_state_of_charge_percent", NONE, Slow, Battery),
    point(0x8B9FF008, "rctmon_battery_state_of_charge_target_percent", NONE, Slow, Battery),
    point(0x902AFAFB, "rctmon_battery_temperature", NONE, Slow, Battery),
    point(0x70A2AF4F, "rctmon_battery_bat_status", NONE, Slow, Battery),
    point(0xE7B0E692, "rctmon_battery_impedance_fine", NONE, Slow, Battery),
    point(0x2BC1E72B, "rctmon_battery_discharge_amp_hours", NONE, Slow, Battery),
    point(0x5570401B, "rctmon_battery_stored_energy", NONE, Slow, Battery),
    point(0xA9033880, "rctmon_battery_used_energy", NONE, Slow, Battery),
    point(0xACF7666B, "rctmon_battery_efficiency", NONE, Slow, Battery),
    point(0xC0DF2978, "rctmon_battery_cycles", NONE, Slow, Battery),
    point(0xCE266F0F, "rctmon_battery_state_of_charge_min_percent", NONE, Static, Battery),
    point(0x381B8BF9, "rctmon_battery_state_of_health_percent", NONE, Static, Battery),
    point(objects::BMS_SERIAL, "rctmon_bms_info", &[("field", "serial_number")], Static, Bms),
];

pub static MODULE_TEMPLATES: &[ModuleTemplate] = &[
    ModuleTemplate {
        oids: MODULE_SERIALS,
        metric: "rctmon_battery_module_info",
        tier: Static,
    },
    ModuleTemplate {
        oids: MODULE_CYCLES,
        metric: "rctmon_battery_module_cycles",
        tier: Static,
    },
];

/// Help text per exported metric
static METRIC_HELP: &[(&str, &str)] = &[
    ("rctmon_inventory", "Shows attached components"),
    ("rctmon_inverter_status", "Status of the inverter"),
    ("rctmon_inverter_info", "Information about the inverter"),
    ("rctmon_temperature", "Temperature values in °C"),
    ("rctmon_household_load_watt", "Household load (sum over phases)"),
    ("rctmon_household_load_phase_watt", "Household load by phase"),
    ("rctmon_grid_power_total_watt", "Power to or from the grid (sum over phases)"),
    ("rctmon_grid_power_watt", "Power to or from the grid by phase"),
    ("rctmon_grid_voltage_volt", "Grid voltage by phase"),
    ("rctmon_generator_voltage_volt", "Solar generator voltage"),
    ("rctmon_generator_power_watt", "Solar generator power"),
    ("rctmon_generator_power_lowpass_watt", "Solar generator power, low-pass filtered"),
    ("rctmon_generator_mpp_target_voltage_volt", "Target voltage of MPP tracker"),
    ("rctmon_generator_mpp_search_step_volt", "MPP search step"),
    ("rctmon_powerswitch_software_version", "Power Switch software version"),
    ("rctmon_powerswitch_bootloader_version", "Power Switch bootloader version"),
    ("rctmon_powerswitch_grid_voltage_volt", "Grid voltage by phase as seen by the Power Switch"),
    ("rctmon_powerswitch_grid_frequency_hertz", "Grid frequency by phase as seen by the Power Switch"),
    ("rctmon_powerstorage_frequency_hertz", "Power Storage frequency by phase"),
    ("rctmon_battery_voltage_volt", "Battery Voltage"),
    ("rctmon_battery_bms_voltage_volt", "Battery voltage reported by the BMS"),
    ("rctmon_battery_power_watt", "Battery Power"),
    ("rctmon_battery_current", "Battery current"),
    ("rctmon_battery_state", "Battery state machine state"),
    ("rctmon_battery_status", "Battery status"),
    ("rctmon_battery_status2", "Battery status (second register)"),
    ("rctmon_battery_state_of_charge_percent", "Battery state of charge"),
    ("rctmon_battery_state_of_charge_target_percent", "Battery target state of charge"),
    ("rctmon_battery_temperature", "Battery temperature"),
    ("rctmon_battery_bat_status", "Battery status"),
    ("rctmon_battery_impedance_fine", "Battery impedance (fine)"),
    ("rctmon_battery_discharge_amp_hours", "Battery cumulative discharge"),
    ("rctmon_battery_stored_energy", "Battery cumulative stored energy"),
    ("rctmon_battery_used_energy", "Battery cumulative used energy"),
    ("rctmon_battery_efficiency", "Battery efficiency"),
    ("rctmon_battery_cycles", "Battery cycle count"),
    ("rctmon_battery_state_of_charge_min_percent", "Battery minimum state of charge"),
    ("rctmon_battery_state_of_health_percent", "Battery state of health"),
    ("rctmon_bms_info", "Information about the battery management system (BMS)"),
    ("rctmon_battery_module_info", "Information about individual battery modules"),
    ("rctmon_battery_module_cycles", "Number of cycles the battery has accumulated over its lifetime"),
];

pub fn metric_help(metric: &str) -> &'static str {
    METRIC_HELP
        .iter()
        .find(|(name, _)| *name == metric)
        .map_or("RCT device reading", |(_, help)| help)
}

/// One identifier to poll, with everything needed to turn its value into a reading
#[derive(Debug, Clone, PartialEq)]
pub struct PollEntry {
    pub oid: u32,
    pub kind: DataKind,
    pub metric: &'static str,
    pub labels: LabelSet,
}

/// Identifiers polled together at one cadence
#[derive(Debug, Clone, PartialEq)]
pub struct PollGroup {
    pub tier: Tier,
    pub cadence: Duration,
    pub entries: Vec<PollEntry>,
}

impl PollGroup {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compute the poll groups for an inventory
///
/// Groups come back in priority order, empty groups are left out and each
/// identifier appears at most once across all groups.
pub fn derive_groups(inventory: &Inventory, cadences: &Cadences) -> Vec<PollGroup> {
    let base = LabelSet::from_pairs([(INVERTER_LABEL, inventory.name.as_str())]);
    let mut seen = HashSet::new();
    let mut groups = Vec::with_capacity(Tier::ALL.len());

    for tier in Tier::ALL {
        let mut entries = Vec::new();

        for def in POINTS
            .iter()
            .filter(|def| def.tier == tier && def.requires.is_met(inventory))
        {
            if let Some(entry) = make_entry(def.oid, def.metric, def.labels.iter().copied(), &base) {
                if seen.insert(entry.oid) {
                    entries.push(entry);
                }
            }
        }

        let modules = inventory
            .battery_modules
            .min(objects::MAX_BATTERY_MODULES);
        for template in MODULE_TEMPLATES.iter().filter(|t| t.tier == tier) {
            for (index, oid) in template.oids.iter().take(modules).enumerate() {
                let module = index.to_string();
                let labels = [("module", module.as_str())];
                if let Some(entry) = make_entry(*oid, template.metric, labels, &base) {
                    if seen.insert(entry.oid) {
                        entries.push(entry);
                    }
                }
            }
        }

        if !entries.is_empty() {
            groups.push(PollGroup {
                tier,
                cadence: cadences.of(tier),
                entries,
            });
        }
    }

    groups
}

fn make_entry<'a, I>(oid: u32, metric: &'static str, labels: I, base: &LabelSet) -> Option<PollEntry>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let info = objects::object(oid)?;
    let mut set = base.clone();
    for (key, value) in labels {
        set.insert(key, value);
    }
    Some(PollEntry {
        oid,
        kind: info.kind,
        metric,
        labels: set,
    })
}
