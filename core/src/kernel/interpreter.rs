//! The per-session interpreter.
//!
//! Each running session owns exactly one `Interpreter`, which owns the
//! Starlark `Module` acting as the session namespace. The interpreter is not
//! `Send`; it lives on the session's kernel thread and is only ever driven
//! from there, which is what serializes executions within a session.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use starlark::PrintHandler;
use starlark::any::ProvidesStaticType;
use starlark::environment::Globals;
use starlark::environment::GlobalsBuilder;
use starlark::environment::Module;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::syntax::AstModule;
use starlark::syntax::Dialect;
use starlark::values::Heap;
use starlark::values::Value;
use starlark::values::dict::AllocDict;
use starlark::values::list::ListRef;
use starlark::values::none::NoneType;

use crucible_protocol::ContentEncoding;
use crucible_protocol::ExecutionArtifact;
use crucible_protocol::OutputStream;

use super::artifacts::kind_for_mime;

/// Callback invoked with output lines as they are produced.
pub type OutputCallback = dyn Fn(OutputStream, &str) + Send + Sync;

/// Rendered stand-in for values whose representation cannot be computed.
const UNREPRESENTABLE: &str = "<unrepresentable>";

/// Host-injected names that never show up in variable snapshots.
const IGNORED_NAMES: &[&str] = &["session_vars", "config"];

/// Cap applied to each rendered variable.
const VARIABLE_RENDER_LIMIT: usize = 500;

/// Cap applied to the rendered value of the final expression.
const OUTPUT_RENDER_LIMIT: usize = 5000;

/// Preview budget for inline `display` payloads.
const INLINE_PREVIEW_LIMIT: usize = 100;

pub(crate) struct EvalOutcome {
    pub stdout: Vec<String>,
    pub error: Option<String>,
    pub output: String,
    /// Inline payloads registered through the `display` builtin.
    pub inline_artifacts: Vec<ExecutionArtifact>,
}

pub(crate) struct Interpreter {
    module: Module,
    globals: Globals,
    cwd: PathBuf,
    session_vars: HashMap<String, String>,
}

/// Per-evaluation state the host builtins reach through `Evaluator::extra`.
#[derive(ProvidesStaticType)]
struct HostContext {
    cwd: PathBuf,
    inline_artifacts: RefCell<Vec<ExecutionArtifact>>,
}

impl HostContext {
    fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            inline_artifacts: RefCell::new(Vec::new()),
        }
    }
}

/// Builtins the host adds on top of the standard globals so executed code
/// can produce artifacts.
#[starlark_module]
fn host_globals(builder: &mut GlobalsBuilder) {
    /// Writes `content` into the session working directory under `name`
    /// (a bare file name; no directory components) and returns the name.
    fn write_file(
        name: &str,
        content: &str,
        eval: &mut Evaluator,
    ) -> anyhow::Result<String> {
        let ctx = eval
            .extra
            .and_then(|extra| extra.downcast_ref::<HostContext>())
            .ok_or_else(|| anyhow!("host context is not installed"))?;
        let valid = Path::new(name).file_name().is_some_and(|base| base == name);
        if !valid {
            return Err(anyhow!("invalid file name '{name}'"));
        }
        fs::write(ctx.cwd.join(name), content)?;
        Ok(name.to_string())
    }

    /// Registers an inline display payload (chart, image markup, table
    /// text) as an artifact of the current execution. The host persists it
    /// into the working directory before the result is returned.
    fn display(
        name: &str,
        content: &str,
        mime_type: &str,
        eval: &mut Evaluator,
    ) -> anyhow::Result<NoneType> {
        let ctx = eval
            .extra
            .and_then(|extra| extra.downcast_ref::<HostContext>())
            .ok_or_else(|| anyhow!("host context is not installed"))?;
        ctx.inline_artifacts.borrow_mut().push(ExecutionArtifact {
            name: name.to_string(),
            kind: kind_for_mime(mime_type),
            mime_type: mime_type.to_string(),
            original_name: String::new(),
            file_name: None,
            file_content: Some(content.to_string()),
            file_content_encoding: ContentEncoding::Utf8,
            preview: content.chars().take(INLINE_PREVIEW_LIMIT).collect(),
            download_url: None,
        });
        Ok(NoneType)
    }
}

fn build_globals() -> Globals {
    let mut builder = GlobalsBuilder::standard();
    host_globals(&mut builder);
    builder.build()
}

/// Captures `print` output and forwards each line to the caller as it is
/// produced.
struct CapturePrint<'a> {
    lines: RefCell<Vec<String>>,
    on_output: Option<&'a OutputCallback>,
}

impl PrintHandler for CapturePrint<'_> {
    fn println(&self, text: &str) -> starlark::Result<()> {
        let line = format!("{text}\n");
        if let Some(on_output) = self.on_output {
            on_output(OutputStream::Stdout, &line);
        }
        self.lines.borrow_mut().push(line);
        Ok(())
    }
}

impl Interpreter {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            module: Module::new(),
            globals: build_globals(),
            cwd,
            session_vars: HashMap::new(),
        }
    }

    /// Shallow-merges into the session variable store. Visible to the next
    /// execution via the `session_vars` dict.
    pub fn update_session_vars(&mut self, vars: HashMap<String, String>) {
        self.session_vars.extend(vars);
    }

    /// Evaluates `code` against the session namespace. Never panics across
    /// this boundary: interpreter failures are rendered into the outcome.
    pub fn execute(&mut self, code: &str, on_output: Option<&OutputCallback>) -> EvalOutcome {
        self.publish_session_vars();

        let ast = match AstModule::parse("exec.star", code.to_owned(), &Dialect::Extended) {
            Ok(ast) => ast,
            Err(err) => {
                return EvalOutcome {
                    stdout: Vec::new(),
                    error: Some(err.to_string()),
                    output: String::new(),
                    inline_artifacts: Vec::new(),
                };
            }
        };

        let handler = CapturePrint {
            lines: RefCell::new(Vec::new()),
            on_output,
        };
        let ctx = HostContext::new(self.cwd.clone());
        let eval_result = {
            let mut eval = Evaluator::new(&self.module);
            eval.set_print_handler(&handler);
            eval.extra = Some(&ctx);
            eval.eval_module(ast, &self.globals)
        };

        let stdout = handler.lines.into_inner();
        let inline_artifacts = ctx.inline_artifacts.into_inner();
        match eval_result {
            Ok(value) => {
                let output = if value.is_none() {
                    String::new()
                } else {
                    truncated(render_value(value), OUTPUT_RENDER_LIMIT)
                };
                EvalOutcome {
                    stdout,
                    error: None,
                    output,
                    inline_artifacts,
                }
            }
            Err(err) => EvalOutcome {
                stdout,
                error: Some(err.to_string()),
                output: String::new(),
                inline_artifacts,
            },
        }
    }

    /// Evaluates plugin source inside the session namespace with `config`
    /// bound, then checks that a callable with the plugin's name exists.
    pub fn load_plugin(
        &mut self,
        name: &str,
        source: &str,
        config: &HashMap<String, serde_json::Value>,
    ) -> Result<(), String> {
        {
            let heap = self.module.heap();
            let entries: Vec<(Value, Value)> = config
                .iter()
                .map(|(key, value)| (heap.alloc(key.as_str()), alloc_json(heap, value)))
                .collect();
            self.module.set("config", heap.alloc(AllocDict(entries)));
        }

        let ast = AstModule::parse(
            &format!("{name}.star"),
            source.to_owned(),
            &Dialect::Extended,
        )
        .map_err(|err| err.to_string())?;

        // Plugin code may call the host builtins at load time; inline
        // payloads registered during a load are dropped (loads have no
        // execution result to attach them to).
        let ctx = HostContext::new(self.cwd.clone());
        let eval_result = {
            let mut eval = Evaluator::new(&self.module);
            eval.extra = Some(&ctx);
            eval.eval_module(ast, &self.globals)
        };
        // The config binding only exists for the duration of the load.
        self.module.set("config", Value::new_none());
        eval_result.map_err(|err| err.to_string())?;

        match self.module.get(name) {
            Some(value) if value.get_type() == "function" => Ok(()),
            _ => Err(format!(
                "plugin source must define a callable named '{name}'"
            )),
        }
    }

    /// Visible variables of the namespace: no `_`-prefixed names, no
    /// host-injected names, no functions or modules.
    pub fn snapshot_variables(&self) -> Vec<(String, String)> {
        let mut variables = Vec::new();
        for name in self.module.names() {
            let name = name.as_str();
            if name.starts_with('_') || IGNORED_NAMES.contains(&name) {
                continue;
            }
            let Some(value) = self.module.get(name) else {
                continue;
            };
            if matches!(value.get_type(), "function" | "module") {
                continue;
            }
            variables.push((
                name.to_string(),
                truncated(render_value(value), VARIABLE_RENDER_LIMIT),
            ));
        }
        variables
    }

    fn publish_session_vars(&self) {
        let heap = self.module.heap();
        let entries: Vec<(Value, Value)> = self
            .session_vars
            .iter()
            .map(|(key, value)| (heap.alloc(key.as_str()), heap.alloc(value.as_str())))
            .collect();
        self.module.set("session_vars", heap.alloc(AllocDict(entries)));
    }
}

fn alloc_json<'v>(heap: &'v Heap, value: &serde_json::Value) -> Value<'v> {
    match value {
        serde_json::Value::Null => Value::new_none(),
        serde_json::Value::Bool(flag) => Value::new_bool(*flag),
        serde_json::Value::Number(number) => match number.as_i64().map(i32::try_from) {
            Some(Ok(int)) => heap.alloc(int),
            _ => heap.alloc(number.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(text) => heap.alloc(text.as_str()),
        // Nested structures are passed through as their JSON text.
        other => heap.alloc(other.to_string()),
    }
}

/// Rendering rules: strings verbatim, numeric lists in ndarray form,
/// everything else by its repr. A panic while rendering becomes the literal
/// `<unrepresentable>`.
fn render_value(value: Value) -> String {
    if let Some(text) = value.unpack_str() {
        return text.to_owned();
    }
    if let Some(rendered) = render_numeric_array(value) {
        return rendered;
    }
    match catch_unwind(AssertUnwindSafe(|| value.to_repr())) {
        Ok(repr) => repr,
        Err(_) => UNREPRESENTABLE.to_string(),
    }
}

fn numeric_dtype(value: Value) -> Option<&'static str> {
    match value.get_type() {
        "int" => Some("int64"),
        "float" => Some("float64"),
        _ => None,
    }
}

/// Lists of numbers (and rectangular lists of lists of numbers) render the
/// way an ndarray would: `ndarray shape=(2, 3) dtype=int64 value=[...]`.
fn render_numeric_array(value: Value) -> Option<String> {
    let list = ListRef::from_value(value)?;
    let items: Vec<Value> = list.iter().collect();
    if items.is_empty() {
        return None;
    }

    let (shape, dtype) = if let Some(dtypes) = items
        .iter()
        .map(|item| numeric_dtype(*item))
        .collect::<Option<Vec<_>>>()
    {
        let dtype = if dtypes.contains(&"float64") {
            "float64"
        } else {
            "int64"
        };
        (format!("({},)", items.len()), dtype)
    } else {
        // Rectangular 2-D case: every item is a numeric list of equal
        // length.
        let rows: Vec<&ListRef> = items
            .iter()
            .map(|item| ListRef::from_value(*item))
            .collect::<Option<Vec<_>>>()?;
        let width = rows.first()?.len();
        if width == 0 || rows.iter().any(|row| row.len() != width) {
            return None;
        }
        let mut dtype = "int64";
        for row in &rows {
            for cell in row.iter() {
                match numeric_dtype(cell) {
                    Some("float64") => dtype = "float64",
                    Some(_) => {}
                    None => return None,
                }
            }
        }
        (format!("({}, {width})", rows.len()), dtype)
    };

    let rendered = match catch_unwind(AssertUnwindSafe(|| value.to_repr())) {
        Ok(repr) => repr,
        Err(_) => return Some(UNREPRESENTABLE.to_string()),
    };
    Some(format!("ndarray shape={shape} dtype={dtype} value={rendered}"))
}

/// Truncates on a char boundary at or below `max_bytes`.
fn truncated(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn interpreter(dir: &TempDir) -> Interpreter {
        Interpreter::new(dir.path().to_path_buf())
    }

    #[test]
    fn last_expression_becomes_output_and_variables_are_visible() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let outcome = interpreter.execute("x = 2 + 2\nx", None);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.output, "4");
        let variables = interpreter.snapshot_variables();
        assert!(variables.contains(&("x".to_string(), "4".to_string())));
    }

    #[test]
    fn print_output_is_captured_in_order_and_streamed() {
        let streamed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = streamed.clone();
        let on_output = move |_stream: OutputStream, text: &str| {
            sink.lock().expect("lock").push(text.to_string());
        };

        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let outcome = interpreter.execute("print('a')\nprint('b')", Some(&on_output));
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.stdout, vec!["a\n".to_string(), "b\n".to_string()]);
        // The streamed lines are exactly the stdout lines, in order.
        assert_eq!(*streamed.lock().expect("lock"), outcome.stdout);
    }

    #[test]
    fn unknown_name_fails_without_destroying_the_session() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let outcome = interpreter.execute("undefined_name", None);
        let error = outcome.error.expect("execution should fail");
        assert!(error.contains("undefined_name"), "error = {error}");

        // The namespace survives a failed execution.
        let outcome = interpreter.execute("y = 1\ny", None);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.output, "1");
    }

    #[test]
    fn state_persists_across_executions() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter.execute("total = 10", None);
        let outcome = interpreter.execute("total + 5", None);
        assert_eq!(outcome.output, "15");
    }

    #[test]
    fn strings_render_verbatim_without_quotes() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter.execute("greeting = 'hello'", None);
        let variables = interpreter.snapshot_variables();
        assert!(variables.contains(&("greeting".to_string(), "hello".to_string())));
    }

    #[test]
    fn numeric_lists_render_as_ndarray() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter.execute("xs = [1, 2, 3]", None);
        let variables = interpreter.snapshot_variables();
        let (_, rendered) = variables
            .iter()
            .find(|(name, _)| name == "xs")
            .expect("xs is visible");
        assert_eq!(rendered, "ndarray shape=(3,) dtype=int64 value=[1, 2, 3]");

        interpreter.execute("grid = [[1.0, 2.0], [3.0, 4.0]]", None);
        let variables = interpreter.snapshot_variables();
        let (_, rendered) = variables
            .iter()
            .find(|(name, _)| name == "grid")
            .expect("grid is visible");
        assert!(rendered.starts_with("ndarray shape=(2, 2) dtype=float64"));
    }

    #[test]
    fn underscore_names_and_functions_are_hidden() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter.execute("_secret = 1\ndef helper():\n    return 2\nvisible = 3", None);
        let names: Vec<String> = interpreter
            .snapshot_variables()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["visible".to_string()]);
    }

    #[test]
    fn rendered_variables_are_capped() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter.execute("big = 'x' * 2000", None);
        let variables = interpreter.snapshot_variables();
        let (_, rendered) = variables
            .iter()
            .find(|(name, _)| name == "big")
            .expect("big is visible");
        assert_eq!(rendered.len(), 500);
    }

    #[test]
    fn session_vars_are_visible_to_code() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter.update_session_vars(HashMap::from([(
            "user".to_string(),
            "ada".to_string(),
        )]));
        let outcome = interpreter.execute("session_vars['user']", None);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.output, "ada");
    }

    #[test]
    fn plugin_binds_a_callable_under_its_name() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter
            .load_plugin("greet", "def greet(who):\n    return 'hi ' + who", &HashMap::new())
            .expect("plugin loads");
        let outcome = interpreter.execute("greet('ada')", None);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.output, "hi ada");
    }

    #[test]
    fn plugin_sees_its_config_during_load() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let config = HashMap::from([(
            "prefix".to_string(),
            serde_json::Value::String(">> ".to_string()),
        )]);
        interpreter
            .load_plugin(
                "tag",
                "PREFIX = config['prefix']\ndef tag(text):\n    return PREFIX + text",
                &config,
            )
            .expect("plugin loads");
        let outcome = interpreter.execute("tag('done')", None);
        assert_eq!(outcome.output, ">> done");
    }

    #[test]
    fn plugin_without_matching_callable_fails() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let err = interpreter
            .load_plugin("missing", "def other():\n    return 1", &HashMap::new())
            .expect_err("load must fail");
        assert!(err.contains("missing"));
    }

    #[test]
    fn plugin_with_syntax_error_fails() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let err = interpreter
            .load_plugin("broken", "def broken(:", &HashMap::new())
            .expect_err("load must fail");
        assert!(!err.is_empty());
    }

    #[test]
    fn write_file_builtin_writes_into_the_cwd() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let outcome = interpreter.execute("write_file('report.txt', 'totals')", None);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.output, "report.txt");
        assert_eq!(
            fs::read_to_string(dir.path().join("report.txt")).expect("read back"),
            "totals"
        );
    }

    #[test]
    fn write_file_builtin_rejects_directory_components() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let outcome = interpreter.execute("write_file('../evil.txt', 'x')", None);
        let error = outcome.error.expect("write must fail");
        assert!(error.contains("invalid file name"), "error = {error}");
        assert!(!dir.path().join("../evil.txt").exists());

        let outcome = interpreter.execute("write_file('a/b.txt', 'x')", None);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn display_builtin_registers_an_inline_artifact() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        let outcome = interpreter.execute("display('drawing', '<svg/>', 'image/svg+xml')", None);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.inline_artifacts.len(), 1);
        let artifact = &outcome.inline_artifacts[0];
        assert_eq!(artifact.name, "drawing");
        assert_eq!(artifact.kind, crucible_protocol::ArtifactKind::Svg);
        assert_eq!(artifact.mime_type, "image/svg+xml");
        assert_eq!(artifact.file_content.as_deref(), Some("<svg/>"));
        assert_eq!(artifact.file_name, None);
        assert_eq!(artifact.preview, "<svg/>");
    }

    #[test]
    fn reloading_a_plugin_replaces_the_binding() {
        let dir = TempDir::new().expect("tempdir");
        let mut interpreter = interpreter(&dir);
        interpreter
            .load_plugin("answer", "def answer():\n    return 1", &HashMap::new())
            .expect("plugin loads");
        interpreter
            .load_plugin("answer", "def answer():\n    return 2", &HashMap::new())
            .expect("plugin reloads");
        let outcome = interpreter.execute("answer()", None);
        assert_eq!(outcome.output, "2");
    }
}
