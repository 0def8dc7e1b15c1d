use std::ffi::CString;
use std::sync::{mpsc, Arc};

use pyo3::exceptions::{PyRuntimeError, PyTypeError};
use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyList, PyModule, PyTuple};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ReplError;
use crate::rlm::bridge::RecursiveBridge;

/// Guard and runner executed with full builtins; model code only ever sees
/// the restricted environment handed to `run`.
const SANDBOX_SOURCE: &str = include_str!("sandbox.py");

pub const NO_CODE: &str = "No code to execute";
pub const NO_OUTPUT: &str = "Code executed successfully (no output)";

pub const ALLOWED_BUILTINS: &[&str] = &[
    // types
    "len", "str", "int", "float", "bool", "list", "dict", "tuple", "set", "frozenset", "bytes",
    "bytearray", "slice",
    // iteration
    "range", "enumerate", "zip", "map", "filter", "reversed", "iter", "next",
    // aggregation
    "sorted", "sum", "min", "max", "any", "all",
    // math
    "abs", "round", "pow", "divmod",
    // string / repr
    "chr", "ord", "hex", "oct", "bin", "repr", "ascii", "format",
    // type checks
    "isinstance", "issubclass", "callable", "type", "hasattr",
    // exceptions model code may want to catch or raise
    "Exception", "ValueError", "TypeError", "KeyError", "IndexError", "AttributeError",
    "ZeroDivisionError", "RuntimeError", "StopIteration", "NameError",
];

const RE_NAMES: &[&str] = &[
    "findall", "finditer", "search", "match", "fullmatch", "split", "sub", "subn", "compile",
    "escape", "error", "IGNORECASE", "I", "MULTILINE", "M", "DOTALL", "S", "VERBOSE", "X",
    "ASCII", "A",
];

const JSON_NAMES: &[&str] = &["loads", "dumps", "JSONDecodeError"];

const MATH_NAMES: &[&str] = &[
    "pi", "e", "tau", "inf", "nan", "sqrt", "floor", "ceil", "trunc", "log", "log2", "log10",
    "exp", "pow", "fabs", "factorial", "gcd", "prod", "fsum", "comb", "perm", "isclose",
    "isfinite", "isinf", "isnan", "sin", "cos", "tan",
];

/// Values bound into a fresh session environment.
pub struct SessionSetup {
    pub context: String,
    pub query: String,
    /// `recursive_llm` capability; absent for standalone sandboxes.
    pub bridge: Option<RecursiveBridge>,
    pub max_output_chars: usize,
}

impl SessionSetup {
    pub fn new(context: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            query: query.into(),
            bridge: None,
            max_output_chars: crate::config::DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    pub fn with_bridge(mut self, bridge: RecursiveBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_max_output_chars(mut self, chars: usize) -> Self {
        self.max_output_chars = chars;
        self
    }
}

enum Request {
    Execute {
        code: String,
        reply: oneshot::Sender<Result<String, ReplError>>,
    },
    Lookup {
        name: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// A Python environment that keeps its globals across code fragments.
/// Runs on a dedicated OS thread; the GIL is taken per request so other
/// sessions (including recursive children) can run while this one waits.
pub struct PersistentSession {
    tx: mpsc::Sender<Request>,
    max_output_chars: usize,
}

impl PersistentSession {
    /// Start the interpreter thread and build the environment.
    pub async fn spawn(setup: SessionSetup) -> Result<Self, ReplError> {
        let max_output_chars = setup.max_output_chars;
        let (tx, rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("rlm-python".to_string())
            .spawn(move || session_thread(setup, rx, ready_tx))
            .map_err(|e| ReplError::Unavailable(format!("failed to spawn Python thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| ReplError::Unavailable("Python thread exited during setup".to_string()))??;

        Ok(Self {
            tx,
            max_output_chars,
        })
    }

    /// Run one model turn: extract its code, execute it, and return the
    /// bounded observation text.
    pub async fn execute(&self, raw_output: &str) -> Result<String, ReplError> {
        let code = extract_code(raw_output);
        if code.trim().is_empty() {
            return Ok(NO_CODE.to_string());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Execute {
                code,
                reply: reply_tx,
            })
            .map_err(|_| ReplError::Unavailable("Python session thread died".to_string()))?;

        let result = reply_rx
            .await
            .map_err(|_| ReplError::Unavailable("Python session reply channel closed".to_string()))?;

        match result {
            Ok(output) => Ok(format_output(&output, self.max_output_chars)),
            Err(ReplError::Runtime { message, output }) => Err(ReplError::Runtime {
                message,
                output: if output.is_empty() {
                    output
                } else {
                    format_output(&output, self.max_output_chars)
                },
            }),
            Err(e) => Err(e),
        }
    }

    /// Run one model turn and return what the model gets to see: the output,
    /// or the fault rendered as feedback. Always within the character budget.
    pub async fn observe(&self, raw_output: &str) -> String {
        match self.execute(raw_output).await {
            Ok(output) => output,
            Err(e) => truncate(&e.to_observation(), self.max_output_chars),
        }
    }

    /// `str()` of an environment binding, `None` if it is not defined.
    pub async fn lookup(&self, name: &str) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Lookup {
                name: name.to_string(),
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok().flatten()
    }
}

fn session_thread(
    setup: SessionSetup,
    rx: mpsc::Receiver<Request>,
    ready: oneshot::Sender<Result<(), ReplError>>,
) {
    let sandbox = match Python::with_gil(|py| Sandbox::new(py, setup)) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            warn!("Failed to set up Python sandbox: {}", e);
            let _ = ready.send(Err(ReplError::Unavailable(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("Persistent Python session initialized");

    // Plain OS-level blocking recv, outside any tokio runtime context.
    while let Ok(req) = rx.recv() {
        match req {
            Request::Execute { code, reply } => {
                let result = Python::with_gil(|py| sandbox.run(py, &code));
                let _ = reply.send(result);
            }
            Request::Lookup { name, reply } => {
                let value = Python::with_gil(|py| sandbox.lookup(py, &name));
                let _ = reply.send(value);
            }
        }
    }

    Python::with_gil(|_py| drop(sandbox));
    debug!("Persistent Python session shutting down");
}

/// Interpreter-side state of one session.
struct Sandbox {
    globals: Py<PyDict>,
    runner: PyObject,
    buffer: PyObject,
}

impl Sandbox {
    fn new(py: Python<'_>, setup: SessionSetup) -> PyResult<Self> {
        let source = CString::new(SANDBOX_SOURCE)?;
        let module = PyModule::from_code(py, &source, c"sandbox.py", c"rlm_sandbox")?;
        let buffer = py.import("io")?.getattr("StringIO")?.call0()?;

        let globals = PyDict::new(py);
        globals.set_item("__builtins__", restricted_builtins(py, &module, &buffer)?)?;
        install_utilities(py, &globals)?;
        globals.set_item("context", setup.context)?;
        globals.set_item("query", setup.query)?;
        if let Some(bridge) = setup.bridge {
            install_bridge(py, &globals, bridge)?;
        }

        Ok(Self {
            globals: globals.unbind(),
            runner: module.getattr("run")?.unbind(),
            buffer: buffer.unbind(),
        })
    }

    fn run(&self, py: Python<'_>, code: &str) -> Result<String, ReplError> {
        debug!(code_len = code.len(), "Executing fragment");
        let (status, message, output): (String, String, String) = self
            .runner
            .bind(py)
            .call1((code, self.globals.bind(py), self.buffer.bind(py)))
            .and_then(|r| r.extract())
            .map_err(|e| ReplError::Runtime {
                message: e.to_string(),
                output: String::new(),
            })?;

        match status.as_str() {
            "ok" => {
                debug!(output_len = output.len(), "Python executed successfully");
                Ok(output)
            }
            "compile" => Err(ReplError::Compile(message)),
            "forbidden" => {
                warn!("Sandbox rejected fragment: {}", message);
                Err(ReplError::Forbidden(message))
            }
            _ => {
                warn!("Python execution error: {}", message);
                Err(ReplError::Runtime { message, output })
            }
        }
    }

    fn lookup(&self, py: Python<'_>, name: &str) -> Option<String> {
        let value = self.globals.bind(py).get_item(name).ok().flatten()?;
        value.str().ok()?.extract::<String>().ok()
    }
}

/// Builtins whitelist plus a session-local `print` writing into `buffer`.
fn restricted_builtins<'py>(
    py: Python<'py>,
    module: &Bound<'py, PyModule>,
    buffer: &Bound<'py, PyAny>,
) -> PyResult<Bound<'py, PyDict>> {
    let builtins = py.import("builtins")?;
    let restricted = PyDict::new(py);

    for name in ALLOWED_BUILTINS {
        if let Ok(obj) = builtins.getattr(*name) {
            restricted.set_item(*name, obj)?;
        }
    }
    restricted.set_item("print", module.getattr("make_print")?.call1((buffer.clone(),))?)?;
    // target of the rewritten `.format` / `.format_map` accesses
    let guard: String = module.getattr("FORMAT_GUARD")?.extract()?;
    restricted.set_item(guard, module.getattr("guarded_format")?)?;

    Ok(restricted)
}

/// Public members of `module`, exposed as a namespace rather than the
/// module object itself so its imports stay unreachable.
fn namespace<'py>(py: Python<'py>, module: &str, names: &[&str]) -> PyResult<Bound<'py, PyAny>> {
    let module = py.import(module)?;
    let members = PyDict::new(py);
    for name in names {
        members.set_item(*name, module.getattr(*name)?)?;
    }
    py.import("types")?
        .getattr("SimpleNamespace")?
        .call((), Some(&members))
}

fn install_utilities(py: Python<'_>, globals: &Bound<'_, PyDict>) -> PyResult<()> {
    globals.set_item("re", namespace(py, "re", RE_NAMES)?)?;
    globals.set_item("json", namespace(py, "json", JSON_NAMES)?)?;
    globals.set_item("math", namespace(py, "math", MATH_NAMES)?)?;

    let datetime = py.import("datetime")?;
    globals.set_item("datetime", datetime.getattr("datetime")?)?;
    globals.set_item("timedelta", datetime.getattr("timedelta")?)?;
    globals.set_item("date", datetime.getattr("date")?)?;

    let collections = py.import("collections")?;
    globals.set_item("Counter", collections.getattr("Counter")?)?;
    globals.set_item("defaultdict", collections.getattr("defaultdict")?)?;

    Ok(())
}

/// Positional argument `index`, or keyword `name`, as a string.
fn str_arg(
    args: &Bound<'_, PyTuple>,
    kwargs: Option<&Bound<'_, PyDict>>,
    index: usize,
    name: &str,
) -> PyResult<String> {
    if index < args.len() {
        return args.get_item(index)?.extract();
    }
    if let Some(kwargs) = kwargs {
        if let Some(value) = kwargs.get_item(name)? {
            return value.extract();
        }
    }
    Err(PyTypeError::new_err(format!(
        "missing required argument: '{}'",
        name
    )))
}

/// Expose the recursive-call capability. Both callables release the GIL
/// while the child sessions run so those sessions can execute their own code.
fn install_bridge(
    py: Python<'_>,
    globals: &Bound<'_, PyDict>,
    bridge: RecursiveBridge,
) -> PyResult<()> {
    let bridge = Arc::new(bridge);

    // recursive_llm(sub_query, sub_context) -> str
    let single = bridge.clone();
    let recursive_llm = PyCFunction::new_closure(
        py,
        Some(c"recursive_llm"),
        Some(c"recursive_llm(sub_query, sub_context) -> str"),
        move |args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<String> {
            let sub_query = str_arg(args, kwargs, 0, "sub_query")?;
            let sub_context = str_arg(args, kwargs, 1, "sub_context")?;
            tracing::debug!(
                sub_query_len = sub_query.len(),
                sub_context_len = sub_context.len(),
                "PyO3: recursive_llm"
            );
            let bridge = single.clone();
            args.py()
                .allow_threads(move || bridge.call_blocking(&sub_query, &sub_context))
                .map_err(|e| PyRuntimeError::new_err(e.to_string()))
        },
    )?;
    globals.set_item("recursive_llm", recursive_llm)?;

    // recursive_llm_batch([(sub_query, sub_context), ...]) -> list[str]
    let batch = bridge;
    let recursive_llm_batch = PyCFunction::new_closure(
        py,
        Some(c"recursive_llm_batch"),
        Some(c"recursive_llm_batch(pairs) -> list[str]"),
        move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
            let pairs: Vec<(String, String)> = args.get_item(0)?.extract()?;
            tracing::debug!(count = pairs.len(), "PyO3: recursive_llm_batch");
            let bridge = batch.clone();
            let answers = args
                .py()
                .allow_threads(move || bridge.call_many_blocking(pairs))
                .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;

            let result = PyList::empty(args.py());
            for answer in answers {
                result.append(answer)?;
            }
            Ok(result.into_any().unbind())
        },
    )?;
    globals.set_item("recursive_llm_batch", recursive_llm_batch)?;

    Ok(())
}

/// Code to run from a model turn: the contents of the first fenced block
/// (language-tagged fences win over bare ones), or the whole text.
pub fn extract_code(text: &str) -> String {
    let tagged = ["```python", "```py", "```repl"];
    let mut best: Option<(usize, usize)> = None;
    for tag in &tagged {
        if let Some(idx) = text.find(tag) {
            match best {
                None => best = Some((idx, tag.len())),
                Some((prev, _)) if idx < prev => best = Some((idx, tag.len())),
                _ => {}
            }
        }
    }
    let fence = best.or_else(|| text.find("```").map(|idx| (idx, 3)));

    let Some((start, tag_len)) = fence else {
        return text.trim().to_string();
    };

    let after_tag = &text[start + tag_len..];
    // skip the rest of the opening fence line
    let code_start = after_tag.find('\n').map(|i| i + 1).unwrap_or(after_tag.len());
    let region = &after_tag[code_start..];
    let end = region.find("```").unwrap_or(region.len());
    region[..end].trim().to_string()
}

/// Apply the character budget. Truncated output keeps an explicit marker
/// with the original length.
pub fn format_output(output: &str, max_chars: usize) -> String {
    if output.is_empty() {
        return NO_OUTPUT.to_string();
    }

    if output.chars().count() > max_chars {
        return truncate(output, max_chars);
    }

    output.trim().to_string()
}

/// First `max_chars` characters of `text` plus a marker with the original
/// length, or `text` unchanged if it fits.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!(
        "{}\n\n[Output truncated: {} chars total, showing first {}]",
        truncated, total, max_chars
    )
}
