use std::fmt::{Display, Formatter};
use std::ops::AddAssign;
use std::time::Duration;

use crate::interface::Domain;

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct Timings {
    pub mesh: Duration,
    pub fluid: Duration,
    pub solid: Duration,
    pub acceleration: Duration,
    pub total: Duration,
}

impl Timings {
    pub fn domain_mut(&mut self, domain: Domain) -> &mut Duration {
        match domain {
            Domain::Mesh => &mut self.mesh,
            Domain::Fluid => &mut self.fluid,
            Domain::Solid => &mut self.solid,
        }
    }
}

impl AddAssign for Timings {
    fn add_assign(&mut self, rhs: Timings) {
        self.mesh += rhs.mesh;
        self.fluid += rhs.fluid;
        self.solid += rhs.solid;
        self.acceleration += rhs.acceleration;
        self.total += rhs.total;
    }
}

impl Display for Timings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Timings (ms):")?;
        writeln!(f, "  Mesh solver time:           {}", self.mesh.as_millis())?;
        writeln!(f, "  Fluid solver time:          {}", self.fluid.as_millis())?;
        writeln!(f, "  Solid solver time:          {}", self.solid.as_millis())?;
        writeln!(
            f,
            "  Acceleration time:          {}",
            self.acceleration.as_millis()
        )?;
        writeln!(f, "  Total:                      {}", self.total.as_millis())
    }
}
