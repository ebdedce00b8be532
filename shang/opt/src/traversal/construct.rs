use itertools::Itertools;
use linked_hash_map::LinkedHashMap;
use shang_ir as ir;
use shang_utils::ShangResult;

/// Value of a pass option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseVal {
    Bool(bool),
    Num(i64),
}

impl ParseVal {
    pub fn bool(&self) -> bool {
        match self {
            ParseVal::Bool(b) => *b,
            ParseVal::Num(_) => panic!("option {self} is not a flag"),
        }
    }

    pub fn num(&self) -> i64 {
        match self {
            ParseVal::Num(n) => *n,
            ParseVal::Bool(_) => panic!("option {self} is not a number"),
        }
    }

    /// The number, or `None` when it is negative. Negative bounds mean
    /// "unbounded".
    pub fn pos_num(&self) -> Option<u64> {
        u64::try_from(self.num()).ok()
    }
}

impl std::fmt::Display for ParseVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseVal::Bool(b) => write!(f, "{b}"),
            ParseVal::Num(n) => write!(f, "{n}"),
        }
    }
}

/// An option accepted by a pass, with its default and parser.
pub struct PassOpt {
    name: &'static str,
    description: &'static str,
    default: ParseVal,
    parse: fn(&str) -> Option<ParseVal>,
}

impl PassOpt {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        default: ParseVal,
        parse: fn(&str) -> Option<ParseVal>,
    ) -> Self {
        Self {
            name,
            description,
            default,
            parse,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn description(&self) -> &'static str {
        self.description
    }

    pub const fn default(&self) -> &ParseVal {
        &self.default
    }

    pub fn parse_bool(s: &str) -> Option<ParseVal> {
        s.parse::<bool>().ok().map(ParseVal::Bool)
    }

    pub fn parse_num(s: &str) -> Option<ParseVal> {
        s.parse::<i64>().ok().map(ParseVal::Num)
    }
}

/// Split `pass:opt` or `pass:opt=value`.
fn split_opt(raw: &str) -> Option<(&str, &str, Option<&str>)> {
    let (pass, rest) = raw.split_once(':')?;
    match rest.split_once('=') {
        Some((opt, value)) => Some((pass, opt, Some(value))),
        None => Some((pass, rest, None)),
    }
}

/// Things with a name, a description and a set of options.
pub trait Named {
    fn name() -> &'static str;
    fn description() -> &'static str;
    fn opts() -> Vec<PassOpt> {
        vec![]
    }
}

/// Passes built from an [ir::Context].
pub trait ConstructPass {
    /// The options addressed to this pass in `ctx.extra_opts`, with every
    /// option it declares but was not given set to its default. A bare
    /// `pass:opt` turns a flag on.
    fn get_opts(ctx: &ir::Context) -> LinkedHashMap<&'static str, ParseVal>
    where
        Self: Named,
    {
        let pass = Self::name();
        let declared = Self::opts();
        let mut values = LinkedHashMap::new();

        for raw in &ctx.extra_opts {
            let Some((target, name, value)) = split_opt(raw) else {
                continue;
            };
            if target != pass {
                continue;
            }
            let Some(opt) = declared.iter().find(|o| o.name == name) else {
                log::warn!("`{pass}' has no option `{name}'");
                continue;
            };
            let parsed = match value {
                None => Some(ParseVal::Bool(true)),
                Some(v) => (opt.parse)(v),
            };
            match parsed {
                Some(v) => {
                    values.insert(opt.name, v);
                }
                None => log::warn!(
                    "ignoring `{raw}': bad value for `{pass}:{name}'"
                ),
            }
        }

        if !values.is_empty() {
            log::debug!(
                "options of `{pass}': {}",
                values.iter().map(|(o, v)| format!("{o}={v}")).join(", ")
            );
        }
        for opt in declared {
            if !values.contains_key(opt.name) {
                values.insert(opt.name, opt.default);
            }
        }
        values
    }

    fn from(ctx: &ir::Context) -> ShangResult<Self>
    where
        Self: Sized;
}
