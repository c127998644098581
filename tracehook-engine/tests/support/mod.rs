// Shared integration test fixtures
#![allow(dead_code)]

pub mod interp;

use std::sync::Arc;
use tracehook_engine::evaluator::{EvaluationFailure, Evaluator, LookupEvaluator};
use tracehook_engine::instrument::ir::{BinaryOp, Condition, InvokeKind, MemberRef, ACC_STATIC, OBJECT_CLASS};
use tracehook_engine::instrument::{ClassIr, Insn, Kind, Label, MethodIr};
use tracehook_engine::location::ClassKeyResolver;
use tracehook_engine::runtime::InMemoryRuntime;
use tracehook_engine::sink::CollectingSink;
use tracehook_engine::{
    AgentConfig, CaptureCallback, ClassTransformer, HookTarget, Locals, TracepointRegistry, Value,
};

pub const ORDERS: &str = "com/example/Orders";
pub const ORDERS_PATH: &str = "src/main/java/com/example/Orders.java";

fn l(n: u32) -> Insn {
    Insn::label(Label(n))
}

/// ```java
/// static int compute(int a) {
/// 10:  int b = a * 2;
/// 11:  return b;
/// }
/// static int ratio(int a, int b) {
/// 20:  int r = a / b;
/// 21:  return r;
/// }
/// static int checked(int a) {
/// 30:  if (a < 0) throw new IllegalArgumentException();
/// 31:  return a + 1;
/// }
/// Orders() {
/// 40:  super(); this.count = 0;
/// 41: }
/// ```
pub fn orders_class() -> ClassIr {
    let compute = MethodIr::new("compute", "(I)I", ACC_STATIC)
        .with_code(vec![
            l(0),
            Insn::line(10),
            Insn::load(Kind::Int, 0),
            Insn::int(2),
            Insn::Binary {
                kind: Kind::Int,
                op: BinaryOp::Mul,
            },
            Insn::store(Kind::Int, 1),
            l(1),
            Insn::line(11),
            Insn::load(Kind::Int, 1),
            Insn::Return { kind: Some(Kind::Int) },
            l(2),
        ])
        .with_local("a", "I", 0, Label(0), Label(2))
        .with_local("b", "I", 1, Label(1), Label(2));

    let ratio = MethodIr::new("ratio", "(II)I", ACC_STATIC)
        .with_code(vec![
            l(0),
            Insn::line(20),
            Insn::load(Kind::Int, 0),
            Insn::load(Kind::Int, 1),
            Insn::Binary {
                kind: Kind::Int,
                op: BinaryOp::Div,
            },
            Insn::store(Kind::Int, 2),
            l(1),
            Insn::line(21),
            Insn::load(Kind::Int, 2),
            Insn::Return { kind: Some(Kind::Int) },
            l(2),
        ])
        .with_local("a", "I", 0, Label(0), Label(2))
        .with_local("b", "I", 1, Label(0), Label(2))
        .with_local("r", "I", 2, Label(1), Label(2));

    let checked = MethodIr::new("checked", "(I)I", ACC_STATIC)
        .with_code(vec![
            l(0),
            Insn::line(30),
            Insn::load(Kind::Int, 0),
            Insn::If {
                cond: Condition::Ge,
                target: Label(1),
            },
            Insn::New {
                class: "java/lang/IllegalArgumentException".to_string(),
            },
            Insn::Dup,
            Insn::invoke(InvokeKind::Special, "java/lang/IllegalArgumentException", "<init>", "()V"),
            Insn::Throw,
            l(1),
            Insn::line(31),
            Insn::load(Kind::Int, 0),
            Insn::int(1),
            Insn::Binary {
                kind: Kind::Int,
                op: BinaryOp::Add,
            },
            Insn::Return { kind: Some(Kind::Int) },
            l(2),
        ])
        .with_local("a", "I", 0, Label(0), Label(2));

    let init = MethodIr::new("<init>", "()V", 0)
        .with_code(vec![
            l(0),
            Insn::line(40),
            Insn::load(Kind::Ref, 0),
            Insn::Invoke {
                kind: InvokeKind::Special,
                method: MemberRef::new(OBJECT_CLASS, "<init>", "()V"),
            },
            Insn::load(Kind::Ref, 0),
            Insn::int(0),
            Insn::PutField {
                field: MemberRef::new(ORDERS, "count", "I"),
            },
            l(1),
            Insn::line(41),
            Insn::Return { kind: None },
            l(2),
        ])
        .with_local("this", "Lcom/example/Orders;", 0, Label(0), Label(2));

    ClassIr::new(ORDERS, Some("Orders.java"))
        .with_method(compute)
        .with_method(ratio)
        .with_method(checked)
        .with_method(init)
}

/// Field lookups plus `lhs == rhs` over names and integer literals
#[derive(Debug, Default)]
pub struct ComparingEvaluator;

impl ComparingEvaluator {
    fn operand(&self, expression: &str, scope: &Locals) -> Result<Value, EvaluationFailure> {
        let operand = expression.trim();
        match operand.parse::<i64>() {
            Ok(number) => Ok(Value::Long(number)),
            Err(_) => LookupEvaluator.evaluate(operand, scope),
        }
    }
}

impl Evaluator for ComparingEvaluator {
    fn evaluate(&self, expression: &str, scope: &Locals) -> Result<Value, EvaluationFailure> {
        match expression.split_once("==") {
            Some((lhs, rhs)) => {
                let lhs = self.operand(lhs, scope)?;
                let rhs = self.operand(rhs, scope)?;
                Ok(Value::Boolean(match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => lhs.render() == rhs.render(),
                }))
            }
            None => self.operand(expression, scope),
        }
    }
}

/// Route engine logs through the test harness; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tracehook_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Runtime, registry, class hook and callback wired the way the agent does
pub struct Harness {
    pub runtime: Arc<InMemoryRuntime>,
    pub registry: Arc<TracepointRegistry>,
    pub sink: Arc<CollectingSink>,
    pub callback: Arc<CaptureCallback>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(ComparingEvaluator))
    }

    pub fn with_evaluator(evaluator: Arc<dyn Evaluator>) -> Self {
        init_tracing();
        let config = AgentConfig::default();
        let runtime = Arc::new(InMemoryRuntime::new());
        let registry = Arc::new(TracepointRegistry::new(
            ClassKeyResolver::from_config(&config),
            runtime.clone(),
        ));
        runtime.add_hook(Arc::new(ClassTransformer::new(registry.clone(), HookTarget::default())));

        let sink = Arc::new(CollectingSink::new());
        let callback = Arc::new(
            CaptureCallback::from_config(&config, registry.clone(), sink.clone()).with_evaluator(evaluator),
        );

        Self {
            runtime,
            registry,
            sink,
            callback,
        }
    }

    /// The installed form of `class`
    pub fn installed(&self, class: &str) -> ClassIr {
        self.runtime
            .installed(class)
            .unwrap_or_else(|| panic!("class {} is not defined", class))
    }
}
