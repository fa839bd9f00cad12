use anvil::hammerer::{AccessLoop, HammerKernel, KernelOp};
use anvil::memory::{DramConfig, Memory};
use anvil::pattern::{
    Aggressor, AggressorAccessPattern, FencingStrategy, FlushingStrategy, FrequencyPatternBuilder,
    FuzzingParameterSet, ParameterOverrides, PatternAddressMapper, SchedulingPolicy,
};
use anvil::util::Rng;
use anvil_interp::InterpKernel;
use std::collections::HashSet;

const CONFIG_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bs-config.json");
const GIB: usize = 1 << 30;
const ACTIVATIONS: usize = 1_000_000;

fn group(ids: &[u64], start_offset: usize, frequency: usize) -> AggressorAccessPattern {
    AggressorAccessPattern {
        aggressors: ids.iter().map(|&i| Aggressor(i)).collect(),
        start_offset,
        frequency,
        amplitude: 1,
    }
}

#[test]
fn test_million_activations_end_to_end() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dram = DramConfig::from_jsonfile(CONFIG_FILE)?;
    let memory = Memory::mmap_aligned(GIB, GIB)?;
    let mut rng = Rng::from_seed(2024);

    let mut params = FuzzingParameterSet::random(76, &ParameterOverrides::default(), &mut rng)?;
    params.total_activations = ACTIVATIONS;
    let groups = vec![group(&[0, 1], 0, 2), group(&[2, 3], 1, 10)];
    let (pattern, _) =
        FrequencyPatternBuilder::new(&params).build_with_groups(groups, 20, &mut rng);
    assert_eq!(pattern.aggressors.len(), ACTIVATIONS);
    assert_eq!(pattern.total_activations, ACTIVATIONS);

    let mut mapper = PatternAddressMapper::new(0, memory.bounds(), rng.fork());
    mapper.randomize_addresses(
        &params,
        &pattern.agg_access_patterns,
        &dram.mem_config,
        true,
    )?;
    let unique = pattern.unique_aggressors();
    let addrs = unique
        .iter()
        .filter_map(|agg| mapper.get(agg))
        .collect::<HashSet<_>>();
    assert_eq!(addrs.len(), unique.len());
    assert!(addrs.iter().all(|a| a.bank == 0));

    let exported = mapper.export_pattern(&pattern, SchedulingPolicy::None, &dram.mem_config)?;
    assert_eq!(exported.len(), ACTIVATIONS);
    for (access, agg) in exported.iter().zip(&pattern.aggressors) {
        let expected = mapper
            .get(agg)
            .map(|a| a.to_virt(memory.ptr, &dram.mem_config) as usize);
        assert_eq!(access.addr(), expected);
    }

    let mut kernel = InterpKernel::new();
    kernel.emit_access_loop(&AccessLoop {
        accesses: exported,
        activations: ACTIVATIONS,
        flushing: FlushingStrategy::EarliestPossible,
        fencing: FencingStrategy::OmitFencing,
        fence_type: Default::default(),
        sync_each_iteration: false,
    })?;
    let run = kernel.run()?;
    assert!(run.cycles > 0);
    assert!(!kernel.ops().iter().any(|op| matches!(op, KernelOp::Fence(_))));
    kernel.release();

    memory.dealloc();
    Ok(())
}
