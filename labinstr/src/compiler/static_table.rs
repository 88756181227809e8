use std::collections::BTreeMap;

use anyhow::anyhow;

use super::quantity::physical_to_raw;
use crate::profile::InstrumentProfile;
use crate::Error;
use labinstr_protocol::{Dtype, Field, Table};

/// Builds the one-row `STATIC_DATA` table. Fields follow the order of the profile's
/// quantities. Quantities without a setpoint are left out, unless they are optional, in
/// which case the "not specified" sentinel is stored. Returns `None` if nothing is set.
pub fn build(profile: &InstrumentProfile, setpoints: &BTreeMap<String, f64>) -> crate::Result<Option<Table>> {
    for name in setpoints.keys() {
        if profile.quantity(name).is_none() {
            return Err(Error::argument(anyhow!("{} has no quantity `{}`", profile.name, name)));
        }
    }
    let mut fields = Vec::new();
    let mut row = Vec::new();
    for quantity in &profile.quantities {
        let value = match setpoints.get(&quantity.name) {
            Some(x) => physical_to_raw(quantity, *x)?,
            None if quantity.optional => quantity.format.sentinel(),
            None => continue,
        };
        fields.push(Field::new(quantity.name.as_str(), quantity.format));
        row.push(value);
    }
    if fields.is_empty() || setpoints.is_empty() {
        return Ok(None);
    }
    let mut table = Table::new(Dtype::new(fields)?);
    table.push_row(&row)?;
    Ok(Some(table))
}
