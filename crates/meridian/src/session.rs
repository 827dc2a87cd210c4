//! Inference session
//!
//! ```text
//! SessionBuilder::build(graph)
//!   ├── create providers (instances, factories, CPU fallback)
//!   ├── resolve
//!   ├── GraphTransformerManager::apply      (optimization level)
//!   ├── partition                           (first claim wins)
//!   └── ExecutionPlan::new                  (kernels, staged initializers)
//!
//! InferenceSession::run(feeds, outputs)
//!   ├── validate feeds and requested outputs
//!   ├── for each step: gather inputs on the provider's device,
//!   │                  compute, release dead values
//!   └── copy outputs to host memory
//! ```
//!
//! The session never mutates its graph after `build`, so `run` takes `&self`
//! and may be called from several threads at once. Every run gets its own
//! value frame; a failed run drops its frame and leaves the session usable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use meridian_core::{ArgId, Device, Error, Graph, MemoryType, Result, Tensor, ThreadPool};
use meridian_optimizer::{default_transformers, GraphTransformer, TransformReport, TransformerLevel};
use meridian_providers::{
    CpuProviderFactory, DeviceRegistry, ExecutionProvider, GpuSimProviderFactory, KernelContext, ProviderFactory,
    CPU_EXECUTION_PROVIDER,
};

use crate::options::{ProviderConfig, SessionOptions};
use crate::partition::{partition, PartitionSummary};
use crate::plan::{ExecutionPlan, ExecutionStep};

#[derive(Debug)]
enum ProviderSource {
    Instance(Arc<dyn ExecutionProvider>),
    Factory(Box<dyn ProviderFactory>),
}

/// Collects options, providers and extra passes, then builds a session.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    options: SessionOptions,
    providers: Vec<ProviderSource>,
    transformers: Vec<(TransformerLevel, Box<dyn GraphTransformer>)>,
    device_registry: Option<Arc<DeviceRegistry>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a ready-made provider. Providers are tried in registration order.
    pub fn with_provider(mut self, provider: Arc<dyn ExecutionProvider>) -> Self {
        self.providers.push(ProviderSource::Instance(provider));
        self
    }

    /// Register a provider created when the session is built.
    pub fn with_provider_factory(mut self, factory: impl ProviderFactory + 'static) -> Self {
        self.providers.push(ProviderSource::Factory(Box::new(factory)));
        self
    }

    /// Devices available to providers listed in [`SessionOptions::providers`].
    pub fn with_device_registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.device_registry = Some(registry);
        self
    }

    /// Run an extra pass after the built-in ones of its level.
    pub fn with_transformer(mut self, level: TransformerLevel, transformer: Box<dyn GraphTransformer>) -> Self {
        self.transformers.push((level, transformer));
        self
    }

    #[tracing::instrument(skip_all, fields(graph = %graph.name()))]
    pub fn build(self, mut graph: Graph) -> Result<InferenceSession> {
        let start = Instant::now();
        let options = self.options;

        let mut sources = self.providers;
        for config in &options.providers {
            sources.push(ProviderSource::Factory(configured_factory(
                *config,
                self.device_registry.as_ref(),
            )?));
        }

        let mut providers = Vec::with_capacity(sources.len() + 1);
        for source in sources {
            let provider = match source {
                ProviderSource::Instance(provider) => provider,
                ProviderSource::Factory(factory) => factory.create_provider()?,
            };
            if providers
                .iter()
                .any(|existing: &Arc<dyn ExecutionProvider>| existing.name() == provider.name())
            {
                return Err(Error::invalid_argument(format!(
                    "provider '{}' is registered more than once",
                    provider.name()
                )));
            }
            providers.push(provider);
        }
        if !providers.iter().any(|provider| provider.name() == CPU_EXECUTION_PROVIDER) {
            let fallback = CpuProviderFactory {
                use_arena: options.cpu_use_arena,
            };
            providers.push(fallback.create_provider()?);
        }

        graph.resolve()?;
        let mut manager = default_transformers(options.constant_folding.clone(), options.max_transform_steps);
        for (level, transformer) in self.transformers {
            manager.register(level, transformer);
        }
        let transform_report = manager.apply(&mut graph, options.graph_optimization_level)?;

        let partition = partition(&mut graph, &providers)?;
        graph.resolve()?;
        let plan = ExecutionPlan::new(&graph, &providers)?;
        let thread_pool = ThreadPool::new(options.intra_op_num_threads)?;

        tracing::info!(
            nodes = graph.node_count(),
            initializers = graph.initializer_count(),
            providers = providers.len(),
            intra_op_threads = thread_pool.num_threads(),
            transform_steps = transform_report.steps,
            duration_us = start.elapsed().as_micros() as u64,
            "session_initialized"
        );

        Ok(InferenceSession {
            options,
            graph,
            providers,
            plan,
            thread_pool,
            transform_report,
            partition,
            run_count: AtomicU64::new(0),
        })
    }
}

fn configured_factory(
    config: ProviderConfig,
    registry: Option<&Arc<DeviceRegistry>>,
) -> Result<Box<dyn ProviderFactory>> {
    Ok(match config {
        ProviderConfig::Cpu { use_arena } => Box::new(CpuProviderFactory { use_arena }),
        ProviderConfig::GpuSim { device_id, use_arena } => {
            let registry = registry.cloned().ok_or_else(|| {
                Error::invalid_argument("a gpu_sim provider is configured but the builder has no device registry")
            })?;
            Box::new(GpuSimProviderFactory {
                device_id,
                use_arena,
                registry,
            })
        }
    })
}

/// A graph optimized, partitioned and ready to run.
#[derive(Debug)]
pub struct InferenceSession {
    options: SessionOptions,
    graph: Graph,
    providers: Vec<Arc<dyn ExecutionProvider>>,
    plan: ExecutionPlan,
    thread_pool: ThreadPool,
    transform_report: TransformReport,
    partition: PartitionSummary,
    run_count: AtomicU64,
}

/// Values alive during one run.
#[derive(Default)]
struct RunFrame {
    /// Each value where its producer put it
    values: HashMap<ArgId, Arc<Tensor>>,
    /// Copies made for readers on other devices
    copies: HashMap<(ArgId, Device), Arc<Tensor>>,
}

impl RunFrame {
    fn release(&mut self, arg: ArgId) {
        self.values.remove(&arg);
        self.copies.retain(|(copied, _), _| *copied != arg);
    }
}

impl InferenceSession {
    /// Build with default options and only the CPU provider.
    pub fn new(graph: Graph) -> Result<Self> {
        SessionBuilder::new().build(graph)
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The graph as optimized and partitioned.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn providers(&self) -> &[Arc<dyn ExecutionProvider>] {
        &self.providers
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn transform_report(&self) -> &TransformReport {
        &self.transform_report
    }

    pub fn partition_summary(&self) -> &PartitionSummary {
        &self.partition
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.thread_pool
    }

    /// Provider assigned to the node called `node`.
    pub fn node_provider(&self, node: &str) -> Option<&str> {
        let index = self.graph.find_node(node)?;
        self.graph.node(index)?.provider.as_deref()
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.graph.inputs().iter().map(|&arg| self.graph.arg_name(arg)).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.graph.outputs().iter().map(|&arg| self.graph.arg_name(arg)).collect()
    }

    /// Runs started so far, successful or not.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    /// Execute the graph.
    ///
    /// Returns the requested outputs in order, in host memory. Fails with
    /// [`Error::InvalidArgument`] for a feed that is not a graph input or
    /// whose element type contradicts the declared one,
    /// [`Error::UnknownOutput`] for a name that is not a graph output, and
    /// [`Error::MissingInput`] when a required input was not fed.
    pub fn run(&self, feeds: HashMap<String, Tensor>, output_names: &[&str]) -> Result<Vec<Tensor>> {
        let run = self.run_count.fetch_add(1, Ordering::Relaxed);
        let _span = meridian_tracing::perf_span!("session_run", run = run, feeds = feeds.len());

        let mut frame = RunFrame::default();
        self.bind_feeds(feeds, &mut frame)?;
        let outputs = output_names
            .iter()
            .map(|&name| {
                self.graph
                    .arg_id(name)
                    .filter(|&arg| self.graph.is_graph_output(arg))
                    .ok_or_else(|| Error::UnknownOutput(name.to_string()))
            })
            .collect::<Result<Vec<ArgId>>>()?;
        self.check_required_inputs(&frame)?;

        for step in self.plan.steps() {
            self.execute(step, &mut frame)?;
        }

        let fetched = outputs
            .iter()
            .map(|&arg| self.fetch(arg, &frame))
            .collect::<Result<Vec<Tensor>>>()?;
        tracing::debug!(run, outputs = fetched.len(), "session_run_complete");
        Ok(fetched)
    }

    fn bind_feeds(&self, feeds: HashMap<String, Tensor>, frame: &mut RunFrame) -> Result<()> {
        for (name, tensor) in feeds {
            let arg = self
                .graph
                .arg_id(&name)
                .filter(|&arg| self.graph.is_graph_input(arg))
                .ok_or_else(|| Error::invalid_argument(format!("'{name}' is not an input of the graph")))?;
            if let Some(declared) = self.graph.arg(arg).dtype() {
                if declared != tensor.dtype() {
                    return Err(Error::invalid_argument(format!(
                        "input '{name}' expects {declared}, got {}",
                        tensor.dtype()
                    )));
                }
            }
            frame.values.insert(arg, Arc::new(tensor));
        }
        Ok(())
    }

    fn check_required_inputs(&self, frame: &RunFrame) -> Result<()> {
        for &arg in self.graph.inputs() {
            if !frame.values.contains_key(&arg) && !self.graph.is_initializer(arg) {
                return Err(Error::MissingInput(self.graph.arg_name(arg).to_string()));
            }
        }
        Ok(())
    }

    fn execute(&self, step: &ExecutionStep, frame: &mut RunFrame) -> Result<()> {
        let node = self
            .graph
            .node(step.node)
            .ok_or_else(|| Error::graph_integrity(format!("{} is missing from the session graph", step.node)))?;
        let provider = &self.providers[step.provider];

        let inputs = node
            .inputs
            .iter()
            .map(|&arg| self.input_on(arg, provider.as_ref(), frame))
            .collect::<Result<Vec<Arc<Tensor>>>>()
            .map_err(|err| err.within_node(&node.name, &node.op_type))?;

        let start = Instant::now();
        let allocator = provider.allocator(MemoryType::Default)?;
        let mut ctx = KernelContext::new(node, &inputs, allocator, &self.thread_pool);
        provider
            .compute(step.kernel.as_ref(), &mut ctx)
            .map_err(|err| err.within_node(&node.name, &node.op_type))?;
        let outputs = ctx
            .into_outputs()
            .map_err(|err| err.within_node(&node.name, &node.op_type))?;

        let elements = outputs.iter().map(Tensor::numel).sum();
        meridian_tracing::performance::record_kernel(
            &node.op_type,
            &node.name,
            provider.name(),
            elements,
            start.elapsed().as_micros() as u64,
        );

        drop(inputs);
        for (&arg, tensor) in node.outputs.iter().zip(outputs) {
            frame.values.insert(arg, Arc::new(tensor));
        }
        for &arg in &step.release {
            frame.release(arg);
        }
        Ok(())
    }

    /// The value of `arg` in `provider`'s default memory, copying it there
    /// if it lives elsewhere.
    fn input_on(&self, arg: ArgId, provider: &dyn ExecutionProvider, frame: &mut RunFrame) -> Result<Arc<Tensor>> {
        let device = provider.device();
        let home = match frame.values.get(&arg) {
            Some(value) => value.clone(),
            None => {
                if let Some(staged) = self.plan.staged_initializer(arg, device) {
                    return Ok(staged.clone());
                }
                let name = self.graph.arg_name(arg);
                self.graph
                    .initializer(name)
                    .cloned()
                    .ok_or_else(|| Error::invalid_argument(format!("value '{name}' is not available")))?
            }
        };

        if home.device() == device {
            return Ok(home);
        }
        if let Some(copy) = frame.copies.get(&(arg, device)) {
            return Ok(copy.clone());
        }
        let allocator = provider.allocator(MemoryType::Default)?;
        let mut copy = Tensor::allocate(home.dtype(), home.shape().clone(), &allocator)?;
        self.copy_between(&home, &mut copy)?;
        let copy = Arc::new(copy);
        frame.copies.insert((arg, device), copy.clone());
        Ok(copy)
    }

    /// Host copy of a graph output.
    fn fetch(&self, arg: ArgId, frame: &RunFrame) -> Result<Tensor> {
        let name = self.graph.arg_name(arg);
        let value = frame
            .values
            .get(&arg)
            .or_else(|| self.graph.initializer(name))
            .ok_or_else(|| Error::graph_integrity(format!("output '{name}' was not produced")))?;
        if value.device() == Device::CPU {
            return value.try_clone();
        }
        let mut host = Tensor::zeros(value.dtype(), value.shape().clone())?;
        self.copy_between(value, &mut host)?;
        Ok(host)
    }

    /// Copy with whichever provider can move data between the two devices,
    /// hopping through host memory when none can do it directly.
    fn copy_between(&self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        let (from, to) = (src.device(), dst.device());
        if let Some(provider) = self.providers.iter().find(|provider| provider.can_copy(from, to)) {
            return provider.copy_tensor(src, dst);
        }
        let via_host = |a: Device, b: Device| self.providers.iter().find(|provider| provider.can_copy(a, b));
        match (via_host(from, Device::CPU), via_host(Device::CPU, to)) {
            (Some(down), Some(up)) => {
                let mut host = Tensor::zeros(src.dtype(), src.shape().clone())?;
                down.copy_tensor(src, &mut host)?;
                up.copy_tensor(&host, dst)
            }
            _ => Err(Error::invalid_argument(format!("no provider can copy from {from} to {to}"))),
        }
    }
}
