use crate::DeviceError;

impl crate::QueryDevice for super::Context {
    type QueryPool = super::QueryPool;

    fn create_query_pool(
        &self,
        desc: crate::QueryPoolDesc,
    ) -> Result<super::QueryPool, DeviceError> {
        log::debug!("Creating query pool '{}' for {} queries", desc.name, desc.count);
        let mut state = self.lock();
        let id = state.next_id();
        let key = state.query_pools.insert(super::PoolEntry {
            id,
            results: vec![None; desc.count as usize],
        });
        Ok(super::QueryPool { key, id })
    }

    fn destroy_query_pool(&self, pool: super::QueryPool) {
        let mut state = self.lock();
        match state.query_pools.get(pool.key) {
            Some(entry) if entry.id == pool.id => {}
            _ => panic!("Stale query pool handle {:?}", pool),
        }
        state.query_pools.remove(pool.key);
    }

    fn get_query_pool_results(
        &self,
        pool: super::QueryPool,
        count: u32,
    ) -> Result<Vec<u64>, DeviceError> {
        let mut state = self.lock();
        if state.take_fault(super::Fault::QueryReadback) {
            return Err(DeviceError::QueryUnavailable);
        }
        let entry = match state.query_pools.get(pool.key) {
            Some(entry) if entry.id == pool.id => entry,
            _ => panic!("Stale query pool handle {:?}", pool),
        };
        if count as usize > entry.results.len() {
            return Err(DeviceError::Validation(format!(
                "requested {} results from a pool of {}",
                count,
                entry.results.len()
            )));
        }
        entry.results[..count as usize]
            .iter()
            .map(|result| result.ok_or(DeviceError::QueryUnavailable))
            .collect()
    }
}
