use std::fmt;
use std::str::FromStr;

/// A bitmask selecting which debug data is attached to the final artifact's
/// `extra` annex.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Include(u8);

impl Include {
    pub const NONE: Include = Include(0);
    pub const ACCESS_LIST: Include = Include(1 << 0);
    pub const PRE_STATE: Include = Include(1 << 1);
    pub const STATE_DIFFS: Include = Include(1 << 2);
    pub const COMMITTED: Include = Include(1 << 3);
    pub const ALL: Include = Include(0b1111);

    pub fn contains(&self, other: Include) -> bool {
        self.0 & other.0 == other.0
    }

    const NAMED: [(Include, &'static str); 4] = [
        (Include::ACCESS_LIST, "accessList"),
        (Include::PRE_STATE, "preState"),
        (Include::STATE_DIFFS, "stateDiffs"),
        (Include::COMMITTED, "committed"),
    ];
}

impl std::ops::BitOr for Include {
    type Output = Include;

    fn bitor(self, rhs: Include) -> Include {
        Include(self.0 | rhs.0)
    }
}

impl fmt::Display for Include {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Include::ALL {
            return f.write_str("all");
        }
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

impl FromStr for Include {
    type Err = String;

    /// Parses a comma-separated list of inclusion names, e.g.
    /// `accessList,stateDiffs`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut include = Include::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            include = include
                | match part {
                    "all" => Include::ALL,
                    "none" => Include::NONE,
                    other => Self::NAMED
                        .iter()
                        .find(|(_, name)| *name == other)
                        .map(|(flag, _)| *flag)
                        .ok_or_else(|| format!("invalid inclusion option: {other}"))?,
                };
        }
        Ok(include)
    }
}
