// Snapshot tests: full generated translation units for small schedules.

use std::collections::BTreeMap;
use std::sync::Arc;

use dlc::block::{CodeFragment, ExecutionBlock, TileAnnotation};
use dlc::buffer::{Buffer, Scope};
use dlc::closure::ClosureGeneration;
use dlc::context::NetworkContext;
use dlc::memory::{MemoryManagement, StructInitialization};
use dlc::pass::Verbosity;
use dlc::pipeline::{run_schedule, CodeTransformation, ScheduledOperation};
use dlc::template::Binding;
use dlc::tiling::{
    MemcpyTransfer, MemoryConstraint, PrecomputedTiling, TileLoopGeneration, TilingSchedule,
    TilingVariableReplacement, VariableReplacementScheme, VariableReplacementUpdate,
};

fn scheduled(name: &str, fragment: CodeFragment) -> ScheduledOperation {
    ScheduledOperation {
        name: name.to_string(),
        block: ExecutionBlock::from_fragments([fragment]),
    }
}

fn names(pairs: &[(&str, &str)]) -> Vec<(String, Binding)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Binding::Name(v.to_string())))
        .collect()
}

fn lower(
    ctx: &mut NetworkContext,
    pipeline: CodeTransformation,
    schedule: Vec<ScheduledOperation>,
) -> String {
    run_schedule(ctx, &pipeline, schedule, Verbosity::default())
        .unwrap()
        .render("dlc_run")
}

#[test]
fn snapshot_memory_only() {
    let mut ctx = NetworkContext::default();
    let f = ctx.types.float32();
    ctx.add(Buffer::variable("x", f, 64), Scope::Global).unwrap();
    ctx.add(Buffer::variable("z", f, 64), Scope::Global).unwrap();
    ctx.add(Buffer::variable("y", f, 64).with_users(["add"]), Scope::Local)
        .unwrap();

    let mut relu = names(&[("in", "x"), ("out", "y")]);
    relu.push(("n".to_string(), Binding::Int(16)));
    let schedule = vec![
        scheduled("relu", CodeFragment::from_source("relu(${in}, ${out}, ${n});", relu)),
        scheduled(
            "add",
            CodeFragment::from_source(
                "add(${a}, ${b}, ${out});",
                names(&[("a", "y"), ("b", "x"), ("out", "z")]),
            ),
        ),
    ];
    let code = lower(
        &mut ctx,
        CodeTransformation::new().with_pass(MemoryManagement::default()),
        schedule,
    );
    insta::assert_snapshot!(code.trim_end(), @r"
void dlc_run(void) {
    /* relu */
    float* y = (float*)dlc_malloc_default(64);
    relu(x, y, 16);
    /* add */
    add(y, x, z);
    dlc_free_default(y);
}
");
}

#[test]
fn snapshot_closure_with_transient() {
    let mut ctx = NetworkContext::default();
    let f = ctx.types.float32();
    ctx.add(Buffer::variable("x", f, 64), Scope::Local).unwrap();
    ctx.add(Buffer::transient("t", f, 16).with_level("L1"), Scope::Local)
        .unwrap();

    let mut bindings = names(&[("out", "x"), ("tmp", "t")]);
    bindings.push(("k".to_string(), Binding::Int(2)));
    let schedule = vec![scheduled(
        "scale",
        CodeFragment::from_source("scale(${out}, ${tmp}, ${k});", bindings),
    )];
    let pipeline = CodeTransformation::new()
        .with_pass(ClosureGeneration::default())
        .with_pass(StructInitialization::default())
        .with_pass(MemoryManagement::default());
    let code = lower(&mut ctx, pipeline, schedule);
    insta::assert_snapshot!(code.trim_end(), @r"
typedef struct {
    float* x;
    void* t;
} scale_closure_args_t;

static void scale_closure(void* closure_args) {
    scale_closure_args_t* args = (scale_closure_args_t*)closure_args;
    float* x = args->x;
    void* t = args->t;
    scale(x, t, 2);
}

void dlc_run(void) {
    /* scale */
    float* x = (float*)dlc_malloc_default(64);
    float* t = (float*)dlc_malloc_L1(16);
    scale_closure_args_t scale_closure_args = { .x = x, .t = t };
    scale_closure(&scale_closure_args);
    dlc_free_L1(t);
}
");
}

#[test]
fn snapshot_tiled_kernel() {
    let mut ctx = NetworkContext::default();
    let f = ctx.types.float32();
    ctx.add(Buffer::variable("x", f, 256), Scope::Global).unwrap();
    ctx.add(Buffer::variable("y", f, 256).with_users(["sink"]), Scope::Local)
        .unwrap();

    let solver = PrecomputedTiling {
        scheme: VariableReplacementScheme {
            per_tile: BTreeMap::from([("rows".to_string(), vec![4, 4, 4, 4])]),
            types: BTreeMap::new(),
        },
        schedules: vec![TilingSchedule {
            input_base_offsets: BTreeMap::from([("in".to_string(), vec![0, 64, 128, 192])]),
            output_base_offsets: BTreeMap::from([("out".to_string(), vec![0, 64, 128, 192])]),
        }],
    };
    let mut bindings = names(&[("in", "x"), ("out", "y")]);
    bindings.push(("rows".to_string(), Binding::Int(4)));
    let conv = CodeFragment::from_source("conv(${in}, ${out}, ${rows});", bindings).with_tiling(
        TileAnnotation {
            constraint: MemoryConstraint::default()
                .with_range("x", "L1", 0, 64)
                .with_range("y", "L1", 64, 64),
            solver: Arc::new(solver),
        },
    );
    let schedule = vec![
        scheduled("conv", conv),
        scheduled(
            "sink",
            CodeFragment::from_source("sink(${in});", names(&[("in", "y")])),
        ),
    ];
    let pipeline = CodeTransformation::new()
        .with_pass(TilingVariableReplacement::new("L1"))
        .with_pass(VariableReplacementUpdate::default())
        .with_pass(TileLoopGeneration::default().with_transfers(Arc::new(MemcpyTransfer)))
        .with_pass(MemoryManagement::default());
    let code = lower(&mut ctx, pipeline, schedule);
    insta::assert_snapshot!(code.trim_end(), @r"
static uint8_t L1_arena[128];
static const uint32_t conv_in_offsets[4] = {0, 64, 128, 192};

static const uint32_t conv_out_offsets[4] = {0, 64, 128, 192};

static const int32_t conv_rows_tiles[4] = {4, 4, 4, 4};

void dlc_run(void) {
    /* conv */
    float* y = (float*)dlc_malloc_default(256);
    float* conv_in_L1 = (float*)((char*)L1_arena + 0);
    float* conv_out_L1 = (float*)((char*)L1_arena + 64);
    int32_t* conv_rows_ref = (int32_t*)((char*)conv_rows_tiles + 0);
    for (int conv_tile = 0; conv_tile < 4; conv_tile++) {
        memcpy(conv_in_L1, (char*)x + conv_in_offsets[conv_tile], 64);
        conv_rows_ref = &conv_rows_tiles[conv_tile];
        conv(conv_in_L1, conv_out_L1, (*conv_rows_ref));
        memcpy((char*)y + conv_out_offsets[conv_tile], conv_out_L1, 64);
    }
    /* sink */
    sink(y);
    dlc_free_default(y);
}
");
}
