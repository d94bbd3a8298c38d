//! Object identifiers known to the collector
//!
//! Names follow the device's own object registry so push sink points can be
//! matched against vendor documentation.

use crate::protocol::DataKind;

/// One queryable object on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub oid: u32,
    pub name: &'static str,
    pub kind: DataKind,
}

const fn obj(oid: u32, name: &'static str, kind: DataKind) -> ObjectInfo {
    ObjectInfo { oid, name, kind }
}

// ============================================================================
// Discovery queries
// ============================================================================

pub const DEVICE_NAME: u32 = 0xEBC62737;
pub const GENERATOR_A_ENABLED: u32 = 0x701A0482;
pub const GENERATOR_B_ENABLED: u32 = 0xFED51BD2;
pub const BATTERY_TYPE: u32 = 0x682CDDA1;
pub const POWER_SWITCH_AVAILABLE: u32 = 0x437B8122;
pub const BMS_SERIAL: u32 = 0x16A1F844;

/// Most battery modules a stack can report
pub const MAX_BATTERY_MODULES: usize = 7;

/// `battery.module_sn[i]`, queried in order until the first empty serial
pub const MODULE_SERIALS: [u32; MAX_BATTERY_MODULES] = [
    0xFBF6D834, 0x99396810, 0x73489528, 0x257B7612, 0x4E699086, 0x162491E8, 0x5939EC5D,
];

/// `battery.stack_cycles[i]`
pub const MODULE_CYCLES: [u32; MAX_BATTERY_MODULES] = [
    0xA6C4FD4A, 0x0CFA8BC4, 0x5BA122A5, 0x89B25F4B, 0x5A9EEFF0, 0x2A30A97E, 0x27C39CEA,
];

pub static OBJECTS: &[ObjectInfo] = &[
    obj(DEVICE_NAME, "android_description", DataKind::String),
    obj(GENERATOR_A_ENABLED, "dc_conv.dc_conv_struct[0].enabled", DataKind::Bool),
    obj(GENERATOR_B_ENABLED, "dc_conv.dc_conv_struct[1].enabled", DataKind::Bool),
    obj(BATTERY_TYPE, "power_mng.battery_type", DataKind::U8),
    obj(POWER_SWITCH_AVAILABLE, "rb485.available", DataKind::Bool),
    obj(BMS_SERIAL, "battery.bms_sn", DataKind::String),
    obj(0xFBF6D834, "battery.module_sn[0]", DataKind::String),
    obj(0x99396810, "battery.module_sn[1]", DataKind::String),
    obj(0x73489528, "battery.module_sn[2]", DataKind::String),
    obj(0x257B7612, "battery.module_sn[3]", DataKind::String),
    obj(0x4E699086, "battery.module_sn[4]", DataKind::String),
    obj(0x162491E8, "battery.module_sn[5]", DataKind::String),
    obj(0x5939EC5D, "battery.module_sn[6]", DataKind::String),
    obj(0xA6C4FD4A, "battery.stack_cycles[0]", DataKind::U16),
    obj(0x0CFA8BC4, "battery.stack_cycles[1]", DataKind::U16),
    obj(0x5BA122A5, "battery.stack_cycles[2]", DataKind::U16),
    obj(0x89B25F4B, "battery.stack_cycles[3]", DataKind::U16),
    obj(0x5A9EEFF0, "battery.stack_cycles[4]", DataKind::U16),
    obj(0x2A30A97E, "battery.stack_cycles[5]", DataKind::U16),
    obj(0x27C39CEA, "battery.stack_cycles[6]", DataKind::U16),
    // Inverter
    obj(0x7924ABD9, "inverter_sn", DataKind::String),
    obj(0xDDD1C2D0, "svnversion", DataKind::String),
    obj(0x68BC034D, "parameter_file", DataKind::String),
    obj(0x5F33284E, "prim_sm.state", DataKind::U8),
    obj(0xF79D41D9, "db.temp1", DataKind::Float),
    obj(0x4F735D10, "db.temp2", DataKind::Float),
    obj(0xC24E85D0, "db.core_temp", DataKind::Float),
    // Solar generators
    obj(0xB55BA2CE, "g_sync.u_sg_avg[0]", DataKind::Float),
    obj(0xAA9AA253, "dc_conv.dc_conv_struct[0].p_dc", DataKind::Float),
    obj(0xDB11855B, "dc_conv.dc_conv_struct[0].p_dc_lp", DataKind::Float),
    obj(0x226A23A4, "dc_conv.dc_conv_struct[0].u_target", DataKind::Float),
    obj(0xBA8B8515, "dc_conv.dc_conv_struct[0].mpp.mpp_step", DataKind::Float),
    obj(0xB0041187, "g_sync.u_sg_avg[1]", DataKind::Float),
    obj(0x0CB5D21B, "dc_conv.dc_conv_struct[1].p_dc_lp", DataKind::Float),
    obj(0x675776B1, "dc_conv.dc_conv_struct[1].u_target", DataKind::Float),
    obj(0x4AE96C12, "dc_conv.dc_conv_struct[1].mpp.mpp_step", DataKind::Float),
    // Household
    obj(0x1AC87AA0, "g_sync.p_ac_load_sum_lp", DataKind::Float),
    obj(0x03A39CA2, "g_sync.p_ac_load[0]", DataKind::Float),
    obj(0x2788928C, "g_sync.p_ac_load[1]", DataKind::Float),
    obj(0xF0B436DD, "g_sync.p_ac_load[2]", DataKind::Float),
    // Grid
    obj(0x91617C58, "g_sync.p_ac_grid_sum_lp", DataKind::Float),
    obj(0x27BE51D9, "g_sync.p_ac_sc[0]", DataKind::Float),
    obj(0xF5584F90, "g_sync.p_ac_sc[1]", DataKind::Float),
    obj(0xB221BCFA, "g_sync.p_ac_sc[2]", DataKind::Float),
    obj(0xCF053085, "g_sync.u_l_rms[0]", DataKind::Float),
    obj(0x54B4684E, "g_sync.u_l_rms[1]", DataKind::Float),
    obj(0x2545E22D, "g_sync.u_l_rms[2]", DataKind::Float),
    // Power switch
    obj(0x27650FE2, "rb485.version_main", DataKind::U32),
    obj(0x173D81E4, "rb485.version_boot", DataKind::U32),
    obj(0x93F976AB, "rb485.u_l_grid[0]", DataKind::Float),
    obj(0x7A9091EA, "rb485.u_l_grid[1]", DataKind::Float),
    obj(0x21EE7CBB, "rb485.u_l_grid[2]", DataKind::Float),
    obj(0x9558AD8A, "rb485.f_grid[0]", DataKind::Float),
    obj(0xFAE429C5, "rb485.f_grid[1]", DataKind::Float),
    obj(0x0104EB6A, "rb485.f_grid[2]", DataKind::Float),
    obj(0x3B5F6B9D, "rb485.f_wr[0]", DataKind::Float),
    obj(0x6FD36B32, "rb485.f_wr[1]", DataKind::Float),
    obj(0x905F707B, "rb485.f_wr[2]", DataKind::Float),
    // Battery
    obj(0x65EED11B, "battery.voltage", DataKind::Float),
    obj(0xA7FA5C5D, "power_mng.u_acc_mix_lp", DataKind::Float),
    obj(0x1156DFD0, "power_mng.battery_power", DataKind::Float),
    obj(0x21961B58, "battery.current", DataKind::Float),
    obj(0x71765BD8, "battery.status", DataKind::I32),
    obj(0x0DE3D20D, "battery.status2", DataKind::I32),
    obj(0xDC667958, "power_mng.state", DataKind::U8),
    obj(0x959930BF, "battery.soc", DataKind::Float),
    obj(0x8B9FF008, "battery.soc_target", DataKind::Float),
    obj(0x902AFAFB, "battery.temperature", DataKind::Float),
    obj(0x70A2AF4F, "battery.bat_status", DataKind::I32),
    obj(0xE7B0E692, "battery.bat_impedance.impedance_fine", DataKind::Float),
    obj(0x2BC1E72B, "battery.discharged_amp_hours", DataKind::Float),
    obj(0x5570401B, "battery.stored_energy", DataKind::Float),
    obj(0xA9033880, "battery.used_energy", DataKind::Float),
    obj(0xACF7666B, "battery.efficiency", DataKind::Float),
    obj(0xC0DF2978, "battery.cycles", DataKind::I32),
    obj(0xCE266F0F, "power_mng.soc_min", DataKind::Float),
    obj(0x381B8BF9, "battery.soh", DataKind::Float),
];

/// Look up an object by identifier
pub fn object(oid: u32) -> Option<&'static ObjectInfo> {
    OBJECTS.iter().find(|info| info.oid == oid)
}

/// Value kind of an identifier, used by the codec's length checks
pub fn kind_of(oid: u32) -> Option<DataKind> {
    object(oid).map(|info| info.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identifiers_unique() {
        let mut seen = HashSet::new();
        for info in OBJECTS {
            assert!(seen.insert(info.oid), "duplicate oid 0x{:08X}", info.oid);
        }
    }

    #[test]
    fn test_module_tables_are_cataloged() {
        for (serial, cycles) in MODULE_SERIALS.iter().zip(MODULE_CYCLES.iter()) {
            assert_eq!(kind_of(*serial), Some(DataKind::String));
            assert_eq!(kind_of(*cycles), Some(DataKind::U16));
        }
    }

    #[test]
    fn test_lookup() {
        let info = object(0xAA9AA253).unwrap();
        assert_eq!(info.kind, DataKind::Float);
        assert_eq!(info.name, "dc_conv.dc_conv_struct[0].p_dc");
        assert!(object(0xDEADBEEF).is_none());
    }
}
