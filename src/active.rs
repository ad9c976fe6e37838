//! The active application: the single instantiated, executing graph.
//!
//! Construction flattens the graph (expanding composite references),
//! assigns filters to threads and creates them there. The lifecycle
//! operations are broadcast to all threads and synchronized with a
//! barrier, so no filter observes a new application state until every
//! filter has completed the previous transition.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};

use crate::config::composite::CompositeFilter;
use crate::environment::FilterHost;
use crate::error::{NexxTError, Result};
use crate::filter::{FilterState, Operation};
use crate::graph::FilterGraph;
use crate::property::{PropertyValue, Variables};
use crate::thread::{CompletionMsg, MockupEntry, NexxtThread};
use crate::transport::{Connection, InterThreadConnection};

/// Timeout for threads to report operation completion.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// A connection of the flattened execution graph.
#[derive(Debug, Clone)]
struct FlatConnection {
    from: String,
    from_port: String,
    to: String,
    to_port: String,
    width: usize,
}

#[derive(Clone)]
struct ProxyTarget {
    node: String,
    port: String,
    widths: Vec<usize>,
}

/// Manages an active filter graph. Lives on the main thread; the graph is
/// assumed fixed for the lifetime of this object.
pub struct ActiveApplication {
    app_name: String,
    threads: Vec<NexxtThread>,
    filters2threads: HashMap<String, String>,
    connections: Vec<FlatConnection>,
    inter_thread_conns: Vec<Arc<InterThreadConnection>>,
    state: FilterState,
    graph_connected: bool,
    done_rx: Receiver<CompletionMsg>,
}

impl ActiveApplication {
    /// Construct the active application from an application graph. The
    /// filters are created on their threads before this returns.
    pub(crate) fn new(
        app_name: &str,
        graph: &FilterGraph,
        root_variables: &Arc<Variables>,
        single_threaded: bool,
    ) -> Result<Self> {
        let (done_tx, done_rx) = unbounded();
        let mut app = Self {
            app_name: app_name.to_string(),
            threads: Vec::new(),
            filters2threads: HashMap::new(),
            connections: Vec::new(),
            inter_thread_conns: Vec::new(),
            state: FilterState::Constructing,
            graph_connected: false,
            done_rx,
        };
        let mut composites = Vec::new();
        app.traverse_and_setup(
            graph,
            "",
            root_variables,
            single_threaded,
            &done_tx,
            &mut composites,
        )?;
        let connections = app.flatten_connections(graph, &composites)?;
        app.connections = connections;
        // create the filters on their threads
        let failures = app.broadcast(Operation::Create)?;
        if failures > 0 {
            tracing::error!("{} filters failed to construct", failures);
        }
        app.state = FilterState::Constructed;
        Ok(app)
    }

    fn thread(&self, name: &str) -> Option<&NexxtThread> {
        self.threads.iter().find(|t| t.name() == name)
    }

    fn traverse_and_setup(
        &mut self,
        graph: &FilterGraph,
        name_prefix: &str,
        variables: &Arc<Variables>,
        single_threaded: bool,
        done_tx: &crossbeam_channel::Sender<CompletionMsg>,
        composites: &mut Vec<(String, Arc<CompositeFilter>)>,
    ) -> Result<()> {
        for basename in graph.base().all_nodes() {
            let filtername = format!("{}/{}", name_prefix, basename);
            let mockup = graph.get_mockup(&basename)?;
            if let Some(cf) = mockup.composite_ref() {
                let composite_vars = mockup
                    .property_collection()
                    .variables()
                    .copy_and_reparent(Some(Arc::clone(variables)));
                composites.push((filtername.clone(), Arc::clone(&cf)));
                let sub = cf.read();
                self.traverse_and_setup(
                    sub.graph(),
                    &filtername,
                    &composite_vars,
                    single_threaded,
                    done_tx,
                    composites,
                )?;
            } else if mockup.composite_role().is_some() {
                // boundary nodes dissolve during expansion
            } else {
                let filter_vars = Variables::new(Some(Arc::clone(variables)));
                let composite_name = if name_prefix.is_empty() {
                    "<root>"
                } else {
                    name_prefix
                };
                filter_vars.set("COMPOSITENAME", composite_name)?;
                filter_vars.set("FILTERNAME", &basename)?;
                filter_vars.set("FULLQUALIFIEDFILTERNAME", &filtername)?;
                filter_vars.set("APPNAME", &self.app_name)?;
                filter_vars.set_readonly([
                    "COMPOSITENAME",
                    "FILTERNAME",
                    "FULLQUALIFIEDFILTERNAME",
                    "APPNAME",
                ]);
                let nexxt_props = mockup
                    .property_collection()
                    .get_child_collection("_nexxT")?;
                let thread_prop = match nexxt_props.get_property("thread")? {
                    PropertyValue::Str(s) => s,
                    other => other.to_string(),
                };
                let thread_name = if single_threaded {
                    "main".to_string()
                } else {
                    filter_vars.subst(&thread_prop)?
                };
                if self.thread(&thread_name).is_none() {
                    // create threads as needed
                    self.threads
                        .push(NexxtThread::new(&thread_name, done_tx.clone()));
                }
                self.thread(&thread_name)
                    .expect("just created")
                    .add_mockup(MockupEntry {
                        fqname: filtername.clone(),
                        mockup: Arc::clone(&mockup),
                        variables: filter_vars,
                    })?;
                self.filters2threads.insert(filtername, thread_name);
            }
        }
        Ok(())
    }

    // ── Composite expansion ──

    fn calculate_proxy_ports(
        composites: &[(String, Arc<CompositeFilter>)],
    ) -> Result<(
        HashMap<(String, String), Vec<ProxyTarget>>,
        HashMap<(String, String), Vec<ProxyTarget>>,
    )> {
        let mut proxy_in: HashMap<(String, String), Vec<ProxyTarget>> = HashMap::new();
        let mut proxy_out: HashMap<(String, String), Vec<ProxyTarget>> = HashMap::new();
        for (comp_name, cf) in composites {
            let sub = cf.read();
            let graph = sub.graph();
            let cin = "CompositeInput";
            for from_port in graph.base().all_output_ports(cin)? {
                let mut targets = Vec::new();
                for (_, _, to_node, to_port) in
                    graph.base().all_connections_from_output_port(cin, &from_port)
                {
                    let width = graph
                        .base()
                        .get_connection_properties(cin, &from_port, &to_node, &to_port)?
                        .width;
                    targets.push(ProxyTarget {
                        node: format!("{}/{}", comp_name, to_node),
                        port: to_port,
                        widths: vec![width],
                    });
                }
                proxy_in.insert((comp_name.clone(), from_port.clone()), targets);
                proxy_out.insert((format!("{}/{}", comp_name, cin), from_port), Vec::new());
            }
            let cout = "CompositeOutput";
            for to_port in graph.base().all_input_ports(cout)? {
                let mut sources = Vec::new();
                for (from_node, from_port, _, _) in
                    graph.base().all_connections_to_input_port(cout, &to_port)
                {
                    let width = graph
                        .base()
                        .get_connection_properties(&from_node, &from_port, cout, &to_port)?
                        .width;
                    sources.push(ProxyTarget {
                        node: format!("{}/{}", comp_name, from_node),
                        port: from_port,
                        widths: vec![width],
                    });
                }
                proxy_out.insert((comp_name.clone(), to_port.clone()), sources);
                proxy_in.insert((format!("{}/{}", comp_name, cout), to_port), Vec::new());
            }
        }
        Ok((Self::compress(proxy_in), Self::compress(proxy_out)))
    }

    /// Resolve transitive proxy dependencies (e.g. a composite input
    /// connected to a nested composite filter).
    fn compress(
        mut proxy: HashMap<(String, String), Vec<ProxyTarget>>,
    ) -> HashMap<(String, String), Vec<ProxyTarget>> {
        loop {
            let mut replacement: Option<((String, String), usize)> = None;
            'outer: for (key, targets) in proxy.iter() {
                for (idx, t) in targets.iter().enumerate() {
                    if proxy.contains_key(&(t.node.clone(), t.port.clone())) {
                        replacement = Some((key.clone(), idx));
                        break 'outer;
                    }
                }
            }
            let Some((key, idx)) = replacement else {
                return proxy;
            };
            let removed = proxy.get_mut(&key).expect("key from iteration").remove(idx);
            let resolved = proxy
                .get(&(removed.node.clone(), removed.port.clone()))
                .expect("checked above")
                .clone();
            let additions: Vec<ProxyTarget> = resolved
                .into_iter()
                .map(|mut t| {
                    t.widths.extend(removed.widths.iter().copied());
                    t
                })
                .collect();
            proxy.get_mut(&key).expect("key from iteration").extend(additions);
        }
    }

    /// All connections of this application with composite boundaries
    /// resolved to concrete producer-to-consumer pairs.
    fn flatten_connections(
        &self,
        root_graph: &FilterGraph,
        composites: &[(String, Arc<CompositeFilter>)],
    ) -> Result<Vec<FlatConnection>> {
        let (proxy_in, proxy_out) = Self::calculate_proxy_ports(composites)?;
        let mut res = Vec::new();
        let mut handle_graph = |prefix: &str, graph: &FilterGraph| -> Result<()> {
            for (from_node, from_port, to_node, to_port) in graph.base().all_connections() {
                let width = graph
                    .base()
                    .get_connection_properties(&from_node, &from_port, &to_node, &to_port)?
                    .width;
                let from_name = format!("{}/{}", prefix, from_node);
                let to_name = format!("{}/{}", prefix, to_node);
                let default_src = vec![ProxyTarget {
                    node: from_name.clone(),
                    port: from_port.clone(),
                    widths: vec![width],
                }];
                let default_dest = vec![ProxyTarget {
                    node: to_name.clone(),
                    port: to_port.clone(),
                    widths: vec![width],
                }];
                let src = proxy_out
                    .get(&(from_name.clone(), from_port.clone()))
                    .unwrap_or(&default_src);
                let dest = proxy_in
                    .get(&(to_name.clone(), to_port.clone()))
                    .unwrap_or(&default_dest);
                for s in src {
                    for d in dest {
                        let mut widths: Vec<usize> = s.widths.clone();
                        widths.extend(d.widths.iter().copied());
                        widths.push(width);
                        let combined = if widths.contains(&0) {
                            0
                        } else {
                            widths.iter().copied().max().unwrap_or(width)
                        };
                        res.push(FlatConnection {
                            from: s.node.clone(),
                            from_port: s.port.clone(),
                            to: d.node.clone(),
                            to_port: d.port.clone(),
                            width: combined,
                        });
                    }
                }
            }
            Ok(())
        };
        for (prefix, cf) in composites {
            let sub = cf.read();
            handle_graph(prefix, sub.graph())?;
        }
        handle_graph("", root_graph)?;
        Ok(res)
    }

    // ── Transport wiring ──

    /// Detect cycles in the thread graph spanned by inter-thread
    /// connections with width > 0.
    fn check_deadlocks(&self) -> Result<()> {
        let mut graph: HashMap<&str, HashSet<&str>> = HashMap::new();
        for conn in &self.connections {
            let from_thread = self.filters2threads.get(&conn.from);
            let to_thread = self.filters2threads.get(&conn.to);
            if let (Some(from_thread), Some(to_thread)) = (from_thread, to_thread) {
                if from_thread != to_thread {
                    graph.entry(from_thread.as_str()).or_default();
                    graph.entry(to_thread.as_str()).or_default();
                    if conn.width > 0 {
                        graph
                            .get_mut(from_thread.as_str())
                            .expect("inserted above")
                            .insert(to_thread.as_str());
                    }
                }
            }
        }
        fn check_cycle<'a>(
            graph: &HashMap<&'a str, HashSet<&'a str>>,
            thread: &'a str,
            cycle_info: &[&'a str],
        ) -> Result<()> {
            if let Some(pos) = cycle_info.iter().position(|t| *t == thread) {
                let mut cycle: Vec<&str> = cycle_info[pos..].to_vec();
                cycle.push(thread);
                return Err(NexxTError::PossibleDeadlock(cycle.join("->")));
            }
            let mut next_info: Vec<&str> = cycle_info.to_vec();
            next_info.push(thread);
            if let Some(successors) = graph.get(thread) {
                for nt in successors {
                    check_cycle(graph, nt, &next_info)?;
                }
            }
            Ok(())
        }
        for thread in graph.keys() {
            check_cycle(&graph, thread, &[])?;
        }
        Ok(())
    }

    /// Wire the transports. Assumed fixed for the lifetime of the active
    /// application, so this runs only once.
    fn setup_connections(&mut self) -> Result<()> {
        if self.graph_connected {
            return Ok(());
        }
        self.check_deadlocks()?;
        for conn in &self.connections {
            let from_thread_name = self
                .filters2threads
                .get(&conn.from)
                .ok_or_else(|| NexxTError::NodeNotFound(conn.from.clone()))?
                .clone();
            let to_thread_name = self
                .filters2threads
                .get(&conn.to)
                .ok_or_else(|| NexxTError::NodeNotFound(conn.to.clone()))?
                .clone();
            let from_host = self
                .thread(&from_thread_name)
                .ok_or_else(|| NexxTError::Internal(format!("thread {} missing", from_thread_name)))?
                .get_filter(&conn.from)?;
            let to_thread = self
                .thread(&to_thread_name)
                .ok_or_else(|| NexxTError::Internal(format!("thread {} missing", to_thread_name)))?;
            let to_host = to_thread.get_filter(&conn.to)?;
            let out_idx = from_host.output_port_index(&conn.from_port)?;
            let in_idx = to_host.input_port_index(&conn.to_port)?;
            if from_thread_name == to_thread_name {
                tracing::info!(
                    "setup direct connection between {}.{} -> {}.{}",
                    conn.from,
                    conn.from_port,
                    conn.to,
                    conn.to_port
                );
                from_host.add_connection(
                    out_idx,
                    Connection::Direct {
                        target: to_host,
                        port: in_idx,
                    },
                );
            } else {
                tracing::info!(
                    "setup inter thread connection between {}.{} -> {}.{}",
                    conn.from,
                    conn.from_port,
                    conn.to,
                    conn.to_port
                );
                let itc = Arc::new(InterThreadConnection::new(
                    conn.width,
                    Arc::clone(to_thread.executor()),
                    to_host,
                    in_idx,
                ));
                from_host.add_connection(out_idx, Connection::Queued(Arc::clone(&itc)));
                self.inter_thread_conns.push(itc);
            }
        }
        self.graph_connected = true;
        Ok(())
    }

    // ── Coordinated operations ──

    fn broadcast(&mut self, op: Operation) -> Result<usize> {
        let barrier = Arc::new(Barrier::new(self.threads.len()));
        for thread in self.threads.iter().filter(|t| !t.is_main()) {
            thread.dispatch_operation(op, &barrier);
        }
        let main_thread = self.threads.iter().find(|t| t.is_main());
        if let Some(main) = main_thread {
            // executes inline, synchronized with the workers at the barrier
            main.dispatch_operation(op, &barrier);
        }
        // pump main-thread events while waiting for the workers, so
        // cross-thread deliveries to main-thread filters keep draining
        let mut failures = 0;
        let mut completed = 0;
        let deadline = std::time::Instant::now() + OPERATION_TIMEOUT;
        while completed < self.threads.len() {
            if let Ok(msg) = self.done_rx.try_recv() {
                failures += msg.failures;
                completed += 1;
                continue;
            }
            if std::time::Instant::now() > deadline {
                return Err(NexxTError::Internal("timeout waiting for threads".into()));
            }
            match main_thread {
                Some(main) => main.pump(Duration::from_millis(10)),
                None => {
                    if let Ok(msg) = self.done_rx.recv_timeout(Duration::from_millis(10)) {
                        failures += msg.failures;
                        completed += 1;
                    }
                }
            }
        }
        Ok(failures)
    }

    fn operation(&mut self, op: Operation) -> Result<()> {
        tracing::trace!(
            "entering {} operation, old state {}",
            op.as_str(),
            self.state
        );
        let (from, to) = op.states();
        if self.state != from {
            return Err(NexxTError::FilterStateMachine {
                from: self.state,
                to: op.transitional_state().unwrap_or(to),
            });
        }
        if op == Operation::Start {
            if let Err(e) = self.setup_connections() {
                // no filter is started; wind the application back down
                // instead of propagating the error
                tracing::error!("{}", e);
                if let Err(e) = self.close() {
                    tracing::error!("error while closing after failed start: {}", e);
                }
                if let Err(e) = self.deinit() {
                    tracing::error!("error while deinitializing after failed start: {}", e);
                }
                return Ok(());
            }
            for itc in &self.inter_thread_conns {
                itc.set_stopped(false);
            }
        }
        if op == Operation::Stop {
            // no new cross-thread samples enter the system during teardown
            for itc in &self.inter_thread_conns {
                itc.set_stopped(true);
            }
        }
        if let Some(transitional) = op.transitional_state() {
            self.state = transitional;
        } else if op == Operation::Destruct {
            self.state = FilterState::Destructing;
        }
        let failures = self.broadcast(op)?;
        let forward = matches!(op, Operation::Init | Operation::Open | Operation::Start);
        if failures > 0 && forward {
            // one rogue filter must not wedge the pipeline, but the
            // application does not advance either
            self.state = from;
        } else {
            self.state = to;
        }
        if op == Operation::Destruct {
            self.stop_threads();
        }
        tracing::trace!(
            "leaving {} operation, new state {}",
            op.as_str(),
            self.state
        );
        Ok(())
    }

    /// Perform the init operation (CONSTRUCTED → INITIALIZED).
    pub fn init(&mut self) -> Result<()> {
        self.operation(Operation::Init)
    }

    /// Perform the open operation (INITIALIZED → OPENED).
    pub fn open(&mut self) -> Result<()> {
        self.operation(Operation::Open)
    }

    /// Wire the transports if necessary and perform the start operation
    /// (OPENED → ACTIVE). A cycle in the thread graph is logged as
    /// `PossibleDeadlock` and not propagated: no filter is started and
    /// the application is closed and deinitialized instead.
    pub fn start(&mut self) -> Result<()> {
        self.operation(Operation::Start)
    }

    /// Perform the stop operation (ACTIVE → OPENED).
    pub fn stop(&mut self) -> Result<()> {
        self.operation(Operation::Stop)
    }

    /// Perform the close operation (OPENED → INITIALIZED).
    pub fn close(&mut self) -> Result<()> {
        self.operation(Operation::Close)
    }

    /// Perform the deinit operation (INITIALIZED → CONSTRUCTED).
    pub fn deinit(&mut self) -> Result<()> {
        self.operation(Operation::Deinit)
    }

    /// Perform the destruct operation (CONSTRUCTED → DESTRUCTED) and stop
    /// the threads.
    pub fn destruct(&mut self) -> Result<()> {
        self.operation(Operation::Destruct)
    }

    /// Transfer the application to DESTRUCTED, passing through whichever
    /// states are needed. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == FilterState::Active {
            self.stop()?;
        }
        if self.state == FilterState::Opened {
            self.close()?;
        }
        if self.state == FilterState::Initialized {
            self.deinit()?;
        }
        if self.state == FilterState::Constructed {
            self.destruct()?;
        }
        if self.state != FilterState::Destructed {
            return Err(NexxTError::Internal(format!(
                "Unexpected state '{}' after shutdown.",
                self.state
            )));
        }
        Ok(())
    }

    fn stop_threads(&mut self) {
        tracing::trace!("stopping threads...");
        for thread in self.threads.iter_mut() {
            if !thread.is_main() {
                thread.cleanup();
            }
        }
    }

    /// Current application state.
    pub fn get_state(&self) -> FilterState {
        self.state
    }

    /// The name of the activated application.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The thread assignment of each filter.
    pub fn filter_threads(&self) -> &HashMap<String, String> {
        &self.filters2threads
    }

    /// A filter by its fully qualified name.
    pub fn get_filter(&self, fqname: &str) -> Result<Arc<FilterHost>> {
        let thread_name = self
            .filters2threads
            .get(fqname)
            .ok_or_else(|| NexxTError::NodeNotFound(fqname.to_string()))?;
        self.thread(thread_name)
            .ok_or_else(|| NexxTError::Internal(format!("thread {} missing", thread_name)))?
            .get_filter(fqname)
    }

    /// Process events of main-thread filters for the given duration.
    pub fn process_events(&self, budget: Duration) {
        match self.threads.iter().find(|t| t.is_main()) {
            Some(main) => main.pump(budget),
            None => std::thread::sleep(budget),
        }
    }
}

impl Drop for ActiveApplication {
    fn drop(&mut self) {
        if !matches!(
            self.state,
            FilterState::Destructing | FilterState::Destructed
        ) {
            tracing::warn!("ActiveApplication: shutdown in destructor");
            let _ = self.shutdown();
        }
    }
}
