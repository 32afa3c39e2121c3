//! Which library calls get intercepted, and which of their invocations get mutated.
//!
//! The target configuration is produced by an external selection tool and handed to the agent
//! as a JSON array of [`TargetFunctionSpec`]s.

use core::fmt::{self, Display};
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use sl2_bolts::Error;

use crate::capture::CapturedCall;

/// A logical input-reading function. Text/binary symbol variants (`ReadEventLogA` and
/// `ReadEventLogW`, for example) share one logical function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Function {
    /// `ReadFile`
    ReadFile = 0,
    /// `recv`
    Recv = 1,
    /// `WinHttpReadData`
    WinHttpReadData = 2,
    /// `InternetReadFile`
    InternetReadFile = 3,
    /// `WinHttpWebSocketReceive`
    WinHttpWebSocketReceive = 4,
    /// `RegQueryValueExA` / `RegQueryValueExW`
    RegQueryValueEx = 5,
    /// `ReadEventLogA` / `ReadEventLogW`
    ReadEventLog = 6,
    /// `fread`
    Fread = 7,
    /// `fread_s`
    FreadS = 8,
    /// `_read`
    Read = 9,
    /// `MapViewOfFile`
    MapViewOfFile = 10,
}

impl Function {
    /// Every logical function, in id order
    pub const ALL: [Function; 11] = [
        Function::ReadFile,
        Function::Recv,
        Function::WinHttpReadData,
        Function::InternetReadFile,
        Function::WinHttpWebSocketReceive,
        Function::RegQueryValueEx,
        Function::ReadEventLog,
        Function::Fread,
        Function::FreadS,
        Function::Read,
        Function::MapViewOfFile,
    ];

    /// Number of logical functions
    pub const COUNT: usize = Self::ALL.len();

    /// Stable numeric id, as reported to the coordinator
    #[inline]
    #[must_use]
    pub fn id(self) -> u32 {
        self as u32
    }

    /// The logical name used in target configurations
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Function::ReadFile => "ReadFile",
            Function::Recv => "recv",
            Function::WinHttpReadData => "WinHttpReadData",
            Function::InternetReadFile => "InternetReadFile",
            Function::WinHttpWebSocketReceive => "WinHttpWebSocketReceive",
            Function::RegQueryValueEx => "RegQueryValueEx",
            Function::ReadEventLog => "ReadEventLog",
            Function::Fread => "fread",
            Function::FreadS => "fread_s",
            Function::Read => "_read",
            Function::MapViewOfFile => "MapViewOfFile",
        }
    }

    /// Look a function up by its logical name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A criterion a call must meet to be mutated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The n-th call of the function, counted from zero
    Index,
    /// Calls returning to a fixed offset inside the main module
    ReturnAddress,
    /// Calls whose argument hash is known
    ArgHash,
}

/// How the listed [`MatchMode`]s combine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// All modes must match
    #[default]
    High,
    /// One matching mode is enough
    Low,
}

/// One entry of the target configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFunctionSpec {
    /// Logical function name, or an exact symbol name
    pub function: String,
    /// Restrict the entry to the module exporting the function
    #[serde(default)]
    pub module: Option<String>,
    /// Unselected entries are ignored
    #[serde(default)]
    pub selected: bool,
    /// Criteria for mutating a call; empty means every call
    #[serde(default)]
    pub mode: Vec<MatchMode>,
    /// How `mode` combines
    #[serde(default)]
    pub precision: Precision,
    /// For [`MatchMode::Index`]
    #[serde(default)]
    pub index: Option<u32>,
    /// For [`MatchMode::ReturnAddress`]
    #[serde(default)]
    pub ret_addr_offset: Option<u64>,
    /// For [`MatchMode::ArgHash`]
    #[serde(default)]
    pub arg_hash: Option<String>,
}

impl TargetFunctionSpec {
    /// A selected entry matching every call of `function`
    #[must_use]
    pub fn selected(function: Function) -> Self {
        Self {
            function: function.name().to_string(),
            module: None,
            selected: true,
            mode: Vec::new(),
            precision: Precision::High,
            index: None,
            ret_addr_offset: None,
            arg_hash: None,
        }
    }

    /// Does this entry name `function`, either logically or by the exact `symbol`?
    #[must_use]
    pub fn names(&self, function: Function, symbol: &str) -> bool {
        self.function == function.name() || self.function == symbol
    }

    /// Does this entry accept the function as exported by `module_name`?
    #[must_use]
    pub fn accepts_module(&self, module_name: &str) -> bool {
        self.module
            .as_deref()
            .map_or(true, |module| module.eq_ignore_ascii_case(module_name))
    }

    /// Does this entry cover calls of `function`? Symbol variants count as their logical name.
    fn function_matches(&self, function: Function) -> bool {
        self.function == function.name()
            || self
                .function
                .strip_suffix(['A', 'W'])
                .is_some_and(|stem| stem == function.name())
    }

    fn mode_matches(
        &self,
        mode: MatchMode,
        call: &CapturedCall,
        call_count: u32,
        main_base: usize,
    ) -> bool {
        match mode {
            MatchMode::Index => self
                .index
                .is_some_and(|index| call_count.checked_sub(1) == Some(index)),
            MatchMode::ReturnAddress => self.ret_addr_offset.is_some_and(|offset| {
                call.return_address.wrapping_sub(main_base) as u64 == offset
            }),
            MatchMode::ArgHash => match (&self.arg_hash, &call.arg_hash) {
                (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
                _ => false,
            },
        }
    }

    /// Should `call`, the `call_count`-th call of its function, be mutated?
    #[must_use]
    pub fn matches(&self, call: &CapturedCall, call_count: u32, main_base: usize) -> bool {
        if self.mode.is_empty() {
            return true;
        }
        let mut results = self
            .mode
            .iter()
            .map(|mode| self.mode_matches(*mode, call, call_count, main_base));
        match self.precision {
            Precision::High => results.all(|m| m),
            Precision::Low => results.any(|m| m),
        }
    }
}

/// The parsed target configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetConfig {
    targets: Vec<TargetFunctionSpec>,
}

impl TargetConfig {
    /// Wrap already parsed entries
    #[must_use]
    pub fn new(targets: Vec<TargetFunctionSpec>) -> Self {
        Self { targets }
    }

    /// Load the JSON configuration at `path`
    pub fn from_path<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|err| {
            Error::illegal_argument(format!("cannot read targets {}: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Parse a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// All entries
    #[must_use]
    pub fn targets(&self) -> &[TargetFunctionSpec] {
        &self.targets
    }

    /// Should `symbol` (logically `function`) be hooked in the module called `module_name`?
    #[must_use]
    pub fn is_selected(&self, function: Function, symbol: &str, module_name: &str) -> bool {
        self.targets.iter().any(|t| {
            t.selected && t.names(function, symbol) && t.accepts_module(module_name)
        })
    }

    /// Should this particular invocation be mutated?
    #[must_use]
    pub fn is_function_targeted(
        &self,
        call: &CapturedCall,
        call_count: u32,
        main_base: usize,
    ) -> bool {
        self.targets.iter().any(|t| {
            t.selected
                && t.function_matches(call.function)
                && t.matches(call, call_count, main_base)
        })
    }
}
