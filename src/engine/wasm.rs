//! The wasmtime-backed engine adapter.
//!
//! Owns the single instance of the prebuilt bucketing module and is the
//! sole path for host→engine calls and engine→host callbacks (time source,
//! log sink, seed source, fatal-abort signal). All calls are serialized
//! behind one mutex; the engine is not reentrant.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rand::{thread_rng, Rng};
use wasmtime::{
    Caller, Global, Instance, Linker, Memory, Module, Store, TypedFunc, WasmParams, WasmResults,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use super::layout;
use super::BucketingEngine;
use crate::events::FlushPayload;
use crate::{BucketedConfig, Error, Result, User, Variable, VariableType};

/// Data available to host callbacks.
struct HostState {
    wasi: WasiP1Ctx,
    /// Details recorded by the abort callback just before it traps the
    /// running call.
    abort: Option<AbortDetails>,
}

#[derive(Debug, Clone)]
struct AbortDetails {
    message: String,
    file_name: String,
    line: u32,
    column: u32,
}

/// Entry points resolved once at instantiation.
#[derive(Clone)]
struct EngineExports {
    asc_new: TypedFunc<(i32, i32), i32>,
    asc_pin: TypedFunc<i32, i32>,
    asc_unpin: TypedFunc<i32, ()>,
    init_event_queue: TypedFunc<(i32, i32, i32), ()>,
    flush_event_queue: TypedFunc<i32, i32>,
    event_queue_size: TypedFunc<i32, i32>,
    on_payload_success: TypedFunc<(i32, i32), ()>,
    on_payload_failure: TypedFunc<(i32, i32, i32), ()>,
    queue_event: TypedFunc<(i32, i32, i32), ()>,
    queue_aggregate_event: TypedFunc<(i32, i32, i32), ()>,
    set_config_data: TypedFunc<(i32, i32), ()>,
    set_platform_data: TypedFunc<i32, ()>,
    set_client_custom_data: TypedFunc<(i32, i32), ()>,
    variable_for_user: TypedFunc<(i32, i32, i32, i32, i32), i32>,
    generate_bucketed_config: TypedFunc<(i32, i32), i32>,
}

struct EngineInner {
    store: Store<HostState>,
    memory: Memory,
    exports: EngineExports,
    /// `VariableType.*` constants exported by the engine, indexed by
    /// [`type_index`].
    variable_type_ids: [i32; 4],
    /// Encoding of the SDK key in engine memory; allocated once, pinned
    /// forever, reused by every call.
    sdk_key_ptr: i32,
}

/// The bucketing engine, reached through an embedded WebAssembly module.
pub struct WasmBucketing {
    inner: Mutex<EngineInner>,
}

impl WasmBucketing {
    /// Load and instantiate the engine module from a file.
    pub fn from_file(path: impl AsRef<Path>, sdk_key: &str) -> Result<WasmBucketing> {
        let engine = wasmtime::Engine::default();
        let module = Module::from_file(&engine, path)
            .map_err(|err| setup_error("failed to load engine module", err))?;
        WasmBucketing::instantiate(engine, module, sdk_key)
    }

    /// Instantiate the engine module from in-memory bytes.
    pub fn from_bytes(module_bytes: &[u8], sdk_key: &str) -> Result<WasmBucketing> {
        let engine = wasmtime::Engine::default();
        let module = Module::new(&engine, module_bytes)
            .map_err(|err| setup_error("failed to load engine module", err))?;
        WasmBucketing::instantiate(engine, module, sdk_key)
    }

    fn instantiate(
        engine: wasmtime::Engine,
        module: Module,
        sdk_key: &str,
    ) -> Result<WasmBucketing> {
        let mut linker: Linker<HostState> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|err| setup_error("failed to link WASI", err))?;
        bind_host_callbacks(&mut linker)?;

        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .inherit_env()
            .build_p1();
        let mut store = Store::new(&engine, HostState { wasi, abort: None });

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|err| setup_error("failed to instantiate engine module", err))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::Engine("engine module exports no memory".to_owned()))?;
        let exports = EngineExports::resolve(&instance, &mut store)?;
        let variable_type_ids = resolve_variable_type_ids(&instance, &mut store)?;

        let mut inner = EngineInner {
            store,
            memory,
            exports,
            variable_type_ids,
            sdk_key_ptr: 0,
        };
        let sdk_key_ptr = inner.alloc_string(sdk_key)?;
        inner.sdk_key_ptr = inner.pin(sdk_key_ptr)?;

        Ok(WasmBucketing {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        // Poisoning is unreachable: engine faults surface as errors, not
        // panics.
        self.inner.lock().expect("engine lock holder should not panic")
    }
}

fn bind_host_callbacks(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap("env", "Date.now", || Utc::now().timestamp_millis() as f64)
        .map_err(|err| setup_error("failed to bind Date.now", err))?;

    linker
        .func_wrap("env", "seed", || {
            Utc::now().timestamp_millis() as f64 * thread_rng().gen::<f64>()
        })
        .map_err(|err| setup_error("failed to bind seed", err))?;

    linker
        .func_wrap(
            "env",
            "abort",
            |mut caller: Caller<'_, HostState>,
             message_ptr: i32,
             file_name_ptr: i32,
             line: i32,
             column: i32|
             -> std::result::Result<(), wasmtime::Error> {
                let (message, file_name) =
                    match caller.get_export("memory").and_then(|e| e.into_memory()) {
                        Some(memory) => {
                            let data = memory.data(&caller);
                            (
                                read_callback_string(data, message_ptr),
                                read_callback_string(data, file_name_ptr),
                            )
                        }
                        None => (String::new(), String::new()),
                    };
                caller.data_mut().abort = Some(AbortDetails {
                    message,
                    file_name,
                    line: line as u32,
                    column: column as u32,
                });
                Err(wasmtime::Error::msg("engine abort"))
            },
        )
        .map_err(|err| setup_error("failed to bind abort", err))?;

    linker
        .func_wrap(
            "env",
            "console.log",
            |mut caller: Caller<'_, HostState>, message_ptr: i32| {
                let message = match caller.get_export("memory").and_then(|e| e.into_memory()) {
                    Some(memory) => read_callback_string(memory.data(&caller), message_ptr),
                    None => String::new(),
                };
                log::warn!(target: "flagpole", "engine console: {message}");
            },
        )
        .map_err(|err| setup_error("failed to bind console.log", err))?;

    Ok(())
}

/// Best-effort string read for callback arguments; callbacks must not fail
/// on malformed pointers.
fn read_callback_string(memory: &[u8], ptr: i32) -> String {
    if ptr == 0 {
        return String::new();
    }
    layout::read_string(memory, ptr as usize).unwrap_or_else(|_| "<unreadable>".to_owned())
}

fn setup_error(context: &str, err: wasmtime::Error) -> Error {
    Error::Engine(format!("{context}: {err:#}"))
}

impl EngineExports {
    fn resolve(instance: &Instance, store: &mut Store<HostState>) -> Result<EngineExports> {
        fn typed<P: WasmParams, R: WasmResults>(
            instance: &Instance,
            store: &mut Store<HostState>,
            name: &str,
        ) -> Result<TypedFunc<P, R>> {
            instance
                .get_typed_func::<P, R>(&mut *store, name)
                .map_err(|err| setup_error(&format!("missing engine entry point {name}"), err))
        }

        Ok(EngineExports {
            asc_new: typed(instance, store, "__new")?,
            asc_pin: typed(instance, store, "__pin")?,
            asc_unpin: typed(instance, store, "__unpin")?,
            init_event_queue: typed(instance, store, "initEventQueue")?,
            flush_event_queue: typed(instance, store, "flushEventQueue")?,
            event_queue_size: typed(instance, store, "eventQueueSize")?,
            on_payload_success: typed(instance, store, "onPayloadSuccess")?,
            on_payload_failure: typed(instance, store, "onPayloadFailure")?,
            queue_event: typed(instance, store, "queueEvent")?,
            queue_aggregate_event: typed(instance, store, "queueAggregateEvent")?,
            set_config_data: typed(instance, store, "setConfigDataUTF8")?,
            set_platform_data: typed(instance, store, "setPlatformDataUTF8")?,
            set_client_custom_data: typed(instance, store, "setClientCustomDataUTF8")?,
            variable_for_user: typed(instance, store, "variableForUser")?,
            generate_bucketed_config: typed(instance, store, "generateBucketedConfigForUserUTF8")?,
        })
    }
}

fn resolve_variable_type_ids(
    instance: &Instance,
    store: &mut Store<HostState>,
) -> Result<[i32; 4]> {
    fn constant(instance: &Instance, store: &mut Store<HostState>, name: &str) -> Result<i32> {
        let global: Global = instance
            .get_global(&mut *store, name)
            .ok_or_else(|| Error::Engine(format!("missing engine constant {name}")))?;
        global
            .get(&mut *store)
            .i32()
            .ok_or_else(|| Error::Engine(format!("engine constant {name} is not an i32")))
    }

    Ok([
        constant(instance, store, "VariableType.Boolean")?,
        constant(instance, store, "VariableType.String")?,
        constant(instance, store, "VariableType.Number")?,
        constant(instance, store, "VariableType.JSON")?,
    ])
}

fn type_index(requested_type: VariableType) -> usize {
    match requested_type {
        VariableType::Boolean => 0,
        VariableType::String => 1,
        VariableType::Number => 2,
        VariableType::JSON => 3,
    }
}

impl EngineInner {
    fn invoke<P: WasmParams, R: WasmResults>(
        &mut self,
        func: TypedFunc<P, R>,
        params: P,
    ) -> Result<R> {
        let result = func.call(&mut self.store, params);
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.engine_error(err)),
        }
    }

    /// Convert a trapped call into a typed error, consuming any abort
    /// details the abort callback recorded on the way out.
    fn engine_error(&mut self, err: wasmtime::Error) -> Error {
        match self.store.data_mut().abort.take() {
            Some(details) => Error::EngineAbort {
                message: details.message,
                file_name: details.file_name,
                line: details.line,
                column: details.column,
            },
            None => Error::Engine(format!("engine call failed: {err:#}")),
        }
    }

    /// Allocate an engine string and copy `value` into it in the engine's
    /// UTF-16 layout. The returned allocation is unpinned; pin it before
    /// any further engine allocation.
    fn alloc_string(&mut self, value: &str) -> Result<i32> {
        let bytes = layout::encode_utf16(value);
        let asc_new = self.exports.asc_new.clone();
        let ptr = self.invoke(asc_new, (bytes.len() as i32, layout::STRING_CLASS_ID))?;
        layout::write_bytes(self.memory.data_mut(&mut self.store), ptr as usize, &bytes)?;
        Ok(ptr)
    }

    /// Allocate an engine byte array (backing buffer + view header) holding
    /// `data`. The buffer is pinned across the header allocation, which
    /// could otherwise collect it.
    fn alloc_byte_array(&mut self, data: &[u8]) -> Result<i32> {
        let asc_new = self.exports.asc_new.clone();
        let buffer = self.invoke(asc_new, (data.len() as i32, layout::ARRAY_BUFFER_CLASS_ID))?;
        let buffer = self.pin(buffer)?;
        let result = self.alloc_byte_array_header(buffer, data);
        self.unpin(buffer);
        result
    }

    fn alloc_byte_array_header(&mut self, buffer: i32, data: &[u8]) -> Result<i32> {
        layout::write_bytes(self.memory.data_mut(&mut self.store), buffer as usize, data)?;
        let asc_new = self.exports.asc_new.clone();
        let header = self.invoke(
            asc_new,
            (layout::ARRAY_HEADER_SIZE as i32, layout::UINT8_ARRAY_CLASS_ID),
        )?;
        layout::write_bytes(
            self.memory.data_mut(&mut self.store),
            header as usize,
            &layout::array_header(buffer as u32, data.len() as u32),
        )?;
        Ok(header)
    }

    fn pin(&mut self, ptr: i32) -> Result<i32> {
        let asc_pin = self.exports.asc_pin.clone();
        self.invoke(asc_pin, ptr)
    }

    fn unpin(&mut self, ptr: i32) {
        let func = self.exports.asc_unpin.clone();
        if let Err(err) = func.call(&mut self.store, ptr) {
            log::error!(target: "flagpole", "failed to unpin engine allocation: {err:#}");
        }
    }

    fn read_string_at(&self, ptr: i32) -> Result<String> {
        layout::read_string(self.memory.data(&self.store), ptr as usize)
    }

    fn read_byte_array_at(&self, ptr: i32) -> Result<Vec<u8>> {
        layout::read_byte_array(self.memory.data(&self.store), ptr as usize)
    }
}

impl BucketingEngine for WasmBucketing {
    fn store_config(&self, config_json: &str) -> Result<()> {
        let mut engine = self.lock();
        let data = engine.alloc_byte_array(config_json.as_bytes())?;
        let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
        engine.invoke(exports.set_config_data, (sdk_key, data))
    }

    fn set_platform_data(&self, platform_json: &str) -> Result<()> {
        let mut engine = self.lock();
        let data = engine.alloc_byte_array(platform_json.as_bytes())?;
        let exports = engine.exports.clone();
        engine.invoke(exports.set_platform_data, data)
    }

    fn set_client_custom_data(&self, custom_data_json: &str) -> Result<()> {
        let mut engine = self.lock();
        let data = engine.alloc_byte_array(custom_data_json.as_bytes())?;
        let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
        engine.invoke(exports.set_client_custom_data, (sdk_key, data))
    }

    fn evaluate_variable(
        &self,
        user: &User,
        key: &str,
        requested_type: VariableType,
    ) -> Result<Option<Variable>> {
        let user_json = serde_json::to_string(user)?;
        let mut engine = self.lock();

        let user_ptr = engine.alloc_string(&user_json)?;
        let user_ptr = engine.pin(user_ptr)?;
        let result = (|| {
            let key_ptr = engine.alloc_string(key)?;
            let type_id = engine.variable_type_ids[type_index(requested_type)];
            let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
            engine.invoke(
                exports.variable_for_user,
                (sdk_key, user_ptr, key_ptr, type_id, 1),
            )
        })();
        engine.unpin(user_ptr);

        let variable_ptr = result?;
        if variable_ptr == 0 {
            // Unknown key, or the engine-resolved type mismatches the
            // requested one.
            return Ok(None);
        }
        let variable_json = engine.read_string_at(variable_ptr)?;
        Ok(Some(serde_json::from_str(&variable_json)?))
    }

    fn generate_bucketed_config(&self, user: &User) -> Result<BucketedConfig> {
        let user_json = serde_json::to_string(user)?;
        let mut engine = self.lock();

        let user_ptr = engine.alloc_byte_array(user_json.as_bytes())?;
        let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
        let config_ptr = engine.invoke(exports.generate_bucketed_config, (sdk_key, user_ptr))?;
        if config_ptr == 0 {
            return Err(Error::Engine(
                "engine returned no bucketed config".to_owned(),
            ));
        }
        let config_bytes = engine.read_byte_array_at(config_ptr)?;
        Ok(serde_json::from_slice(&config_bytes)?)
    }

    fn init_event_queue(&self, client_instance_id: &str, options_json: &str) -> Result<()> {
        let mut engine = self.lock();

        let instance_id_ptr = engine.alloc_string(client_instance_id)?;
        let instance_id_ptr = engine.pin(instance_id_ptr)?;
        let result = (|| {
            let options_ptr = engine.alloc_string(options_json)?;
            let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
            engine.invoke(
                exports.init_event_queue,
                (sdk_key, instance_id_ptr, options_ptr),
            )
        })();
        engine.unpin(instance_id_ptr);
        result
    }

    fn queue_event(&self, user_json: &str, event_json: &str) -> Result<()> {
        let mut engine = self.lock();

        let user_ptr = engine.alloc_string(user_json)?;
        let user_ptr = engine.pin(user_ptr)?;
        let result = (|| {
            let event_ptr = engine.alloc_string(event_json)?;
            let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
            engine.invoke(exports.queue_event, (sdk_key, user_ptr, event_ptr))
        })();
        engine.unpin(user_ptr);
        result
    }

    fn queue_aggregate_event(&self, event_json: &str, variation_map_json: &str) -> Result<()> {
        let mut engine = self.lock();

        let event_ptr = engine.alloc_string(event_json)?;
        let event_ptr = engine.pin(event_ptr)?;
        let result = (|| {
            let map_ptr = engine.alloc_string(variation_map_json)?;
            let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
            engine.invoke(
                exports.queue_aggregate_event,
                (sdk_key, event_ptr, map_ptr),
            )
        })();
        engine.unpin(event_ptr);
        result
    }

    fn event_queue_size(&self) -> Result<usize> {
        let mut engine = self.lock();
        let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
        let size = engine.invoke(exports.event_queue_size, sdk_key)?;
        Ok(size.max(0) as usize)
    }

    fn flush_event_queue(&self) -> Result<Vec<FlushPayload>> {
        let mut engine = self.lock();
        let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
        let payloads_ptr = engine.invoke(exports.flush_event_queue, sdk_key)?;
        if payloads_ptr == 0 {
            return Ok(Vec::new());
        }
        let payloads_json = engine.read_string_at(payloads_ptr)?;
        Ok(serde_json::from_str(&payloads_json)?)
    }

    fn report_payload_outcome(
        &self,
        payload_id: &str,
        success: bool,
        retryable: bool,
    ) -> Result<()> {
        let mut engine = self.lock();
        let payload_id_ptr = engine.alloc_string(payload_id)?;
        let (exports, sdk_key) = (engine.exports.clone(), engine.sdk_key_ptr);
        if success {
            engine.invoke(exports.on_payload_success, (sdk_key, payload_id_ptr))
        } else {
            engine.invoke(
                exports.on_payload_failure,
                (sdk_key, payload_id_ptr, retryable as i32),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::layout::encode_utf16;

    /// Escape bytes for a WAT data-segment string.
    fn wat_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("\\{b:02x}")).collect()
    }

    /// A data segment holding an engine string: byte length at `addr - 4`,
    /// UTF-16LE data at `addr`.
    fn string_segment(addr: u32, value: &str) -> String {
        let data = encode_utf16(value);
        let mut bytes = (data.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&data);
        format!("(data (i32.const {}) \"{}\")", addr - 4, wat_bytes(&bytes))
    }

    /// A data segment holding an engine byte array: 12-byte view header at
    /// `header_addr`, data right after it.
    fn byte_array_segment(header_addr: u32, value: &str) -> String {
        let data_addr = header_addr + layout::ARRAY_HEADER_SIZE as u32;
        let mut bytes = layout::array_header(data_addr, value.len() as u32).to_vec();
        bytes.extend_from_slice(value.as_bytes());
        format!("(data (i32.const {header_addr}) \"{}\")", wat_bytes(&bytes))
    }

    const ABORT_MESSAGE_PTR: u32 = 600;
    const ABORT_FILE_PTR: u32 = 700;
    const FLUSH_JSON_PTR: u32 = 1000;
    const VARIABLE_JSON_PTR: u32 = 2000;
    const BUCKETED_HEADER_PTR: u32 = 3000;

    const FLUSH_JSON: &str = r#"[{"payloadId":"payload-1","eventCount":2,"records":[{"user":{"user_id":"u-1"},"events":[{"type":"customEvent"},{"type":"customEvent"}]}]}]"#;
    const VARIABLE_JSON: &str =
        r#"{"_id":"v-1","key":"show-banner","type":"Boolean","value":true}"#;
    const BUCKETED_JSON: &str =
        r#"{"project":{"_id":"p-1","key":"web"},"environment":{"_id":"e-1","key":"prod"}}"#;

    /// A stand-in engine module with the real entry points: a bump
    /// allocator, canned evaluation results, and an aborting
    /// `queueAggregateEvent`.
    fn stub_engine_wat() -> String {
        format!(
            r#"(module
  (import "env" "abort" (func $abort (param i32 i32 i32 i32)))
  (memory (export "memory") 4)
  (global $heap (mut i32) (i32.const 8192))
  (global (export "VariableType.Boolean") i32 (i32.const 0))
  (global (export "VariableType.String") i32 (i32.const 1))
  (global (export "VariableType.Number") i32 (i32.const 2))
  (global (export "VariableType.JSON") i32 (i32.const 3))
  (func (export "__new") (param $size i32) (param $id i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (i32.add (global.get $heap) (i32.const 4)))
    (i32.store (i32.sub (local.get $ptr) (i32.const 4)) (local.get $size))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (local.get $ptr) (local.get $size)) (i32.const 15))
        (i32.const -8)))
    (local.get $ptr))
  (func (export "__pin") (param i32) (result i32) (local.get 0))
  (func (export "__unpin") (param i32))
  (func (export "initEventQueue") (param i32 i32 i32))
  (func (export "eventQueueSize") (param i32) (result i32) (i32.const 3))
  (func (export "onPayloadSuccess") (param i32 i32))
  (func (export "onPayloadFailure") (param i32 i32 i32))
  (func (export "queueEvent") (param i32 i32 i32))
  (func (export "queueAggregateEvent") (param i32 i32 i32)
    (call $abort
      (i32.const {ABORT_MESSAGE_PTR})
      (i32.const {ABORT_FILE_PTR})
      (i32.const 12)
      (i32.const 34)))
  (func (export "setConfigDataUTF8") (param i32 i32))
  (func (export "setPlatformDataUTF8") (param i32))
  (func (export "setClientCustomDataUTF8") (param i32 i32))
  (func (export "variableForUser") (param i32 i32 i32 i32 i32) (result i32)
    (if (result i32) (i32.eq (local.get 3) (i32.const 0))
      (then (i32.const {VARIABLE_JSON_PTR}))
      (else (i32.const 0))))
  (func (export "generateBucketedConfigForUserUTF8") (param i32 i32) (result i32)
    (i32.const {BUCKETED_HEADER_PTR}))
  (func (export "flushEventQueue") (param i32) (result i32)
    (i32.const {FLUSH_JSON_PTR}))
  {abort_message}
  {abort_file}
  {flush_json}
  {variable_json}
  {bucketed_config}
)"#,
            abort_message = string_segment(ABORT_MESSAGE_PTR, "queue full"),
            abort_file = string_segment(ABORT_FILE_PTR, "engine.ts"),
            flush_json = string_segment(FLUSH_JSON_PTR, FLUSH_JSON),
            variable_json = string_segment(VARIABLE_JSON_PTR, VARIABLE_JSON),
            bucketed_config = byte_array_segment(BUCKETED_HEADER_PTR, BUCKETED_JSON),
        )
    }

    fn stub_engine() -> WasmBucketing {
        WasmBucketing::from_bytes(stub_engine_wat().as_bytes(), "fp_server_test-key")
            .expect("stub engine should instantiate")
    }

    #[test]
    fn one_way_pushes_succeed() {
        let engine = stub_engine();
        engine.store_config(r#"{"project":{}}"#).unwrap();
        engine.set_platform_data(r#"{"sdkType":"server"}"#).unwrap();
        engine.set_client_custom_data(r#"{"plan":"pro"}"#).unwrap();
    }

    #[test]
    fn queue_size_crosses_the_boundary() {
        let engine = stub_engine();
        assert_eq!(engine.event_queue_size().unwrap(), 3);
    }

    #[test]
    fn evaluation_decodes_engine_result() {
        let engine = stub_engine();
        let variable = engine
            .evaluate_variable(&User::new("u-1"), "show-banner", VariableType::Boolean)
            .unwrap()
            .expect("stub returns a Boolean variable");

        assert_eq!(variable.key, "show-banner");
        assert_eq!(variable.variable_type, VariableType::Boolean);
        assert_eq!(variable.value.as_boolean(), Some(true));
    }

    #[test]
    fn null_result_means_no_variable() {
        let engine = stub_engine();
        // The stub only answers Boolean requests; anything else misses.
        let result = engine
            .evaluate_variable(&User::new("u-1"), "show-banner", VariableType::String)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn flush_decodes_payload_batches() {
        let engine = stub_engine();
        let payloads = engine.flush_event_queue().unwrap();

        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].payload_id, "payload-1");
        assert_eq!(payloads[0].event_count, 2);
        assert_eq!(payloads[0].records.len(), 1);
        assert_eq!(payloads[0].records[0].events.len(), 2);
    }

    #[test]
    fn bucketed_config_decodes_byte_array_result() {
        let engine = stub_engine();
        let config = engine.generate_bucketed_config(&User::new("u-1")).unwrap();

        assert_eq!(config.project.key, "web");
        assert_eq!(config.environment.key, "prod");
        assert!(config.variables.is_empty());
    }

    #[test]
    fn payload_outcomes_are_reported() {
        let engine = stub_engine();
        engine
            .report_payload_outcome("payload-1", true, false)
            .unwrap();
        engine
            .report_payload_outcome("payload-1", false, true)
            .unwrap();
    }

    #[test]
    fn engine_abort_surfaces_message_and_location() {
        let engine = stub_engine();
        let err = engine
            .queue_aggregate_event(r#"{"type":"aggVariableDefaulted"}"#, "{}")
            .unwrap_err();

        match err {
            Error::EngineAbort {
                message,
                file_name,
                line,
                column,
            } => {
                assert_eq!(message, "queue full");
                assert_eq!(file_name, "engine.ts");
                assert_eq!(line, 12);
                assert_eq!(column, 34);
            }
            other => panic!("expected engine abort, got {other:?}"),
        }
    }

    #[test]
    fn queue_operations_accept_events() {
        let engine = stub_engine();
        engine.init_event_queue("instance-1", "{}").unwrap();
        engine
            .queue_event(r#"{"user_id":"u-1"}"#, r#"{"type":"purchase"}"#)
            .unwrap();
    }
}
