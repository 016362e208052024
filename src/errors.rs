/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use thiserror::Error;

/// Every fatal condition the kernel can raise. Host code is expected to
/// `?`-propagate these; none of them is retriable.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("function symbol is still generating (circular dependency); use call_with_convention or jump_subroutine instead")]
    CircularDependency,

    #[error("function returns disagree on register size: rts/rtl at instruction {index} expected a={expected_a:?} xy={expected_xy:?}, found a={found_a:?} xy={found_xy:?}")]
    InconsistentReturnSizes {
        index: usize,
        expected_a: crate::instr::RegSize,
        expected_xy: crate::instr::RegSize,
        found_a: crate::instr::RegSize,
        found_xy: crate::instr::RegSize,
    },

    #[error("relocation targets a symbol with no assigned ROM offset")]
    UnknownSymbol,

    #[error("mapping mode '{0}' is not implemented")]
    UnimplementedMapping(&'static str),

    #[error("branch relocation's target label was never defined")]
    UndefinedLabel,

    #[error("a branch relocation's final offset does not fit in a signed 8-bit displacement")]
    BranchOutOfRange,

    #[error("register operand at instruction {index} has no register-size mode set")]
    UnsizedRegisterOperand { index: usize },

    #[error("register handle is stale: issued at generation {issued}, current generation is {current}")]
    StaleRegisterHandle { issued: u32, current: u32 },

    #[error("ROM buffer is too small: need at least {needed} bytes, got {actual}")]
    RomTooSmall { needed: usize, actual: usize },

    #[error("debug source information unavailable for this instruction")]
    DebugInfoUnavailable,

    #[error("could not open debug source file: {0}")]
    DebugSourceOpenFailure(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;
