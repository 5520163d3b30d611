//! Channel mode-string interpretation.

use crate::isupport::Isupport;

/// One applied mode change, e.g. `+o alice` or `-l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub add: bool,
    pub mode: char,
    pub arg: Option<String>,
}

impl ModeChange {
    /// Parse a MODE parameter list (`+ov-k alice bob secret`) into
    /// individual changes, consuming arguments per the CHANMODES
    /// categorization and the PREFIX table.
    ///
    /// Type A (list) and type B modes always consume an argument; type C
    /// only when setting; type D never; membership-prefix modes always.
    /// Changes whose required argument is missing are dropped.
    pub fn parse(isupport: &Isupport, args: &[String]) -> Vec<ModeChange> {
        let Some(modestring) = args.first() else {
            return Vec::new();
        };
        let mut params = args.iter().skip(1);
        let mut changes = Vec::new();
        let mut add = true;

        for c in modestring.chars() {
            match c {
                '+' => add = true,
                '-' => add = false,
                mode => {
                    let takes_arg = isupport.prefix_rank(mode).is_some()
                        || isupport.chanmodes.list.contains(mode)
                        || isupport.chanmodes.always_param.contains(mode)
                        || (add && isupport.chanmodes.param_on_set.contains(mode));
                    let arg = if takes_arg {
                        match params.next() {
                            Some(a) => Some(a.clone()),
                            None => continue,
                        }
                    } else {
                        None
                    };
                    changes.push(ModeChange { add, mode, arg });
                }
            }
        }
        changes
    }
}
