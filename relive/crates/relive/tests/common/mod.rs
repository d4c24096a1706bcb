//! Test utilities for the relive integration suite
//!
//! Every fixture owns its own runtime, so tests never share registries,
//! heaps or coordinator threads.

#![allow(dead_code)]

use relive::model::{AccessFlags, Assembler};
use relive::{ClassDef, Runtime, ThreadHandle, UpdateConfig, UpdateReport, UpdateRequest, Vm};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest any single test waits for an update
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime with a coordinator, torn down on drop
pub struct UpdateFixture {
    pub runtime: Runtime,
}

impl UpdateFixture {
    pub fn new() -> Self {
        Self::with_config(UpdateConfig::default())
    }

    pub fn with_config(config: UpdateConfig) -> Self {
        let runtime = Runtime::new(config).expect("runtime should start with a valid config");
        Self { runtime }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        self.runtime.vm()
    }

    pub fn define(&self, def: ClassDef) {
        let name = def.name.clone();
        self.vm()
            .define_class(def)
            .unwrap_or_else(|e| panic!("defining {} failed: {}", name, e));
    }

    pub fn thread(&self, name: &str) -> ThreadHandle {
        self.vm().attach_thread(name)
    }

    /// Submit and wait, failing the test if the coordinator does not answer
    pub fn update(&self, request: UpdateRequest) -> UpdateReport {
        self.runtime
            .submit_timeout(request, TEST_TIMEOUT)
            .expect("coordinator should answer")
    }

    pub fn redefine(&self, def: ClassDef) -> UpdateReport {
        self.update(UpdateRequest::builder().redefine(def).build())
    }
}

/// Poll `cond` until it holds or `TEST_TIMEOUT` passes
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < TEST_TIMEOUT {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Instance method `name()I` returning `value`
pub fn returns(mut def: ClassDef, name: &str, value: i8) -> ClassDef {
    let code = Assembler::new(&mut def).iconst(value).ireturn().finish();
    def.method(name, "()I", code)
}

/// Static method `name()I` returning `value`
pub fn static_returns(mut def: ClassDef, name: &str, value: i8) -> ClassDef {
    let code = Assembler::new(&mut def).iconst(value).ireturn().finish();
    def.static_method(name, "()I", code)
}

/// Instance getter `get_<field>()I` reading an int field of `class`
pub fn getter(mut def: ClassDef, class: &str, field: &str) -> ClassDef {
    let code = Assembler::new(&mut def)
        .aload0()
        .getfield(class, field, "I")
        .ireturn()
        .finish();
    def.method(&format!("get_{}", field), "()I", code)
}

/// Static native method bound by name
pub fn native(def: ClassDef, name: &str, sig: &str) -> ClassDef {
    def.native_method(name, sig, AccessFlags::PUBLIC | AccessFlags::STATIC)
}
