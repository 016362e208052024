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

//! Symbol identity (spec.md §3, "Symbol"). A `Symbol` is a tagged sum over
//! three kinds of thing the kernel can reference: a raw CPU address, a
//! function whose body is a generator callback, and a named owned byte blob.

use std::path::PathBuf;
use std::rc::Rc;

use crate::builder::Builder;
use crate::errors::Result;

/// A host-provided function body. Takes the function's own `Builder` and
/// emits instructions into it.
pub type Generator = dyn Fn(&mut Builder) -> Result<()>;

struct FunctionSymbolInner {
    generator: Box<Generator>,
    name: Option<String>,
    source_location: Option<(PathBuf, u32)>,
}

/// A function symbol. Identity is the generator's allocation — two
/// `FunctionSymbol`s are equal exactly when they were cloned from the same
/// `register_function`/`new` call, matching spec.md §3's "identity = the
/// generator callback pointer".
#[derive(Clone)]
pub struct FunctionSymbol(Rc<FunctionSymbolInner>);

impl FunctionSymbol {
    pub fn new(generator: impl Fn(&mut Builder) -> Result<()> + 'static) -> Self {
        FunctionSymbol(Rc::new(FunctionSymbolInner {
            generator: Box::new(generator),
            name: None,
            source_location: None,
        }))
    }

    pub fn named(name: impl Into<String>, generator: impl Fn(&mut Builder) -> Result<()> + 'static) -> Self {
        FunctionSymbol(Rc::new(FunctionSymbolInner {
            generator: Box::new(generator),
            name: Some(name.into()),
            source_location: None,
        }))
    }

    pub fn with_source(
        name: impl Into<String>,
        source_location: (PathBuf, u32),
        generator: impl Fn(&mut Builder) -> Result<()> + 'static,
    ) -> Self {
        FunctionSymbol(Rc::new(FunctionSymbolInner {
            generator: Box::new(generator),
            name: Some(name.into()),
            source_location: Some(source_location),
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn source_location(&self) -> Option<&(PathBuf, u32)> {
        self.0.source_location.as_ref()
    }

    pub(crate) fn generate(&self, builder: &mut Builder) -> Result<()> {
        (self.0.generator)(builder)
    }

    /// Stable identity usable as a map key, independent of `Rc` cloning.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for FunctionSymbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for FunctionSymbol {}

impl std::fmt::Debug for FunctionSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSymbol")
            .field("name", &self.0.name)
            .field("id", &self.id())
            .finish()
    }
}

struct DataSymbolInner {
    name: Option<String>,
    bytes: Vec<u8>,
}

/// A data symbol: an owning reference to a named byte blob (spec.md §3,
/// "identity = an owning reference to a named byte blob").
#[derive(Clone)]
pub struct DataSymbol(Rc<DataSymbolInner>);

impl DataSymbol {
    pub fn new(bytes: Vec<u8>) -> Self {
        DataSymbol(Rc::new(DataSymbolInner { name: None, bytes }))
    }

    pub fn named(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        DataSymbol(Rc::new(DataSymbolInner {
            name: Some(name.into()),
            bytes,
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for DataSymbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for DataSymbol {}

impl std::fmt::Debug for DataSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSymbol")
            .field("name", &self.0.name)
            .field("len", &self.0.bytes.len())
            .field("id", &self.id())
            .finish()
    }
}

/// The tagged sum described by spec.md §3. Address symbols are raw 24-bit
/// CPU addresses (memory-mapped registers, typically); they occupy no ROM
/// space and need no registration action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Symbol {
    Address(u32),
    Function(FunctionSymbol),
    Data(DataSymbol),
}

impl Symbol {
    pub fn as_function(&self) -> Option<&FunctionSymbol> {
        match self {
            Symbol::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataSymbol> {
        match self {
            Symbol::Data(d) => Some(d),
            _ => None,
        }
    }
}
