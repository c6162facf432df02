//! The embedding store owns every trainable array of a two-tower model: both
//! id tables and both towers' layer parameters. All mutation goes through
//! [`EmbeddingStore::apply`].

use super::initializer::InitializationMethod;
use super::optimizer::Optimizer;
use super::tower::{LayerGradient, Tower};
use crate::error::{Result, Table, TowerError};
use nalgebra::DMatrix;
use rand::Rng;

/// Identifies one trainable array, stable across steps so optimizers can key
/// their state by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    UserTable,
    ItemTable,
    UserWeights(usize),
    UserBias(usize),
    ItemWeights(usize),
    ItemBias(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingStore {
    user_table: DMatrix<f32>,
    item_table: DMatrix<f32>,
    user_tower: Tower,
    item_tower: Tower,
}

/// Gradients laid out exactly like the store they were computed for.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub user_table: DMatrix<f32>,
    pub item_table: DMatrix<f32>,
    pub user_tower: Vec<LayerGradient>,
    pub item_tower: Vec<LayerGradient>,
}

impl EmbeddingStore {
    /// Gaussian-initialized id tables of width `base_dim`.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        num_users: usize,
        num_items: usize,
        base_dim: usize,
        init_std: f32,
        user_tower: Tower,
        item_tower: Tower,
    ) -> Self {
        let method = InitializationMethod::Normal {
            mean: 0.0,
            std_dev: init_std,
        };
        Self {
            user_table: method.initialize_matrix(rng, num_users, base_dim),
            item_table: method.initialize_matrix(rng, num_items, base_dim),
            user_tower,
            item_tower,
        }
    }

    /// Builds a store around explicit tables, e.g. for seeded experiments.
    pub fn from_tables(
        user_table: DMatrix<f32>,
        item_table: DMatrix<f32>,
        user_tower: Tower,
        item_tower: Tower,
    ) -> Result<Self> {
        if user_table.ncols() != item_table.ncols() {
            return Err(TowerError::config(format!(
                "user table width {} differs from item table width {}",
                user_table.ncols(),
                item_table.ncols()
            )));
        }
        Ok(Self {
            user_table,
            item_table,
            user_tower,
            item_tower,
        })
    }

    pub fn num_users(&self) -> usize {
        self.user_table.nrows()
    }

    pub fn num_items(&self) -> usize {
        self.item_table.nrows()
    }

    pub fn base_dim(&self) -> usize {
        self.user_table.ncols()
    }

    pub fn table(&self, table: Table) -> &DMatrix<f32> {
        match table {
            Table::User => &self.user_table,
            Table::Item => &self.item_table,
        }
    }

    pub fn tower(&self, table: Table) -> &Tower {
        match table {
            Table::User => &self.user_tower,
            Table::Item => &self.item_tower,
        }
    }

    pub fn check_index(&self, table: Table, index: usize) -> Result<()> {
        let len = self.table(table).nrows();
        if index >= len {
            return Err(TowerError::IndexOutOfBounds { table, index, len });
        }
        Ok(())
    }

    /// Gathers the rows at `indices`, in order. Duplicates are allowed.
    pub fn lookup(&self, table: Table, indices: &[usize]) -> Result<DMatrix<f32>> {
        for &index in indices {
            self.check_index(table, index)?;
        }
        let source = self.table(table);
        Ok(DMatrix::from_fn(indices.len(), source.ncols(), |r, c| {
            source[(indices[r], c)]
        }))
    }

    /// Every trainable array with its key, in a fixed order.
    pub fn parameters(&self) -> Vec<(ParamKey, &[f32])> {
        let mut params = vec![
            (ParamKey::UserTable, self.user_table.as_slice()),
            (ParamKey::ItemTable, self.item_table.as_slice()),
        ];
        for (i, layer) in self.user_tower.layers().iter().enumerate() {
            params.push((ParamKey::UserWeights(i), layer.weights.as_slice()));
            params.push((ParamKey::UserBias(i), layer.bias.as_slice()));
        }
        for (i, layer) in self.item_tower.layers().iter().enumerate() {
            params.push((ParamKey::ItemWeights(i), layer.weights.as_slice()));
            params.push((ParamKey::ItemBias(i), layer.bias.as_slice()));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<(ParamKey, &mut [f32])> {
        let mut params = vec![
            (ParamKey::UserTable, self.user_table.as_mut_slice()),
            (ParamKey::ItemTable, self.item_table.as_mut_slice()),
        ];
        for (i, layer) in self.user_tower.layers_mut().iter_mut().enumerate() {
            params.push((ParamKey::UserWeights(i), layer.weights.as_mut_slice()));
            params.push((ParamKey::UserBias(i), layer.bias.as_mut_slice()));
        }
        for (i, layer) in self.item_tower.layers_mut().iter_mut().enumerate() {
            params.push((ParamKey::ItemWeights(i), layer.weights.as_mut_slice()));
            params.push((ParamKey::ItemBias(i), layer.bias.as_mut_slice()));
        }
        params
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, values)| values.len()).sum()
    }

    pub fn zero_gradients(&self) -> Gradients {
        let zeros = |tower: &Tower| -> Vec<LayerGradient> {
            tower
                .layers()
                .iter()
                .map(|layer| LayerGradient {
                    weights: DMatrix::zeros(layer.in_dim(), layer.out_dim()),
                    bias: nalgebra::RowDVector::zeros(layer.out_dim()),
                })
                .collect()
        };
        Gradients {
            user_table: DMatrix::zeros(self.user_table.nrows(), self.user_table.ncols()),
            item_table: DMatrix::zeros(self.item_table.nrows(), self.item_table.ncols()),
            user_tower: zeros(&self.user_tower),
            item_tower: zeros(&self.item_tower),
        }
    }

    /// Applies one optimizer step to every parameter at once.
    pub fn apply(&mut self, gradients: &Gradients, optimizer: &mut dyn Optimizer) -> Result<()> {
        let grads = gradients.entries();
        let mut params = self.parameters_mut();
        if grads.len() != params.len() {
            return Err(TowerError::DimensionMismatch {
                context: "gradient count",
                expected: params.len(),
                actual: grads.len(),
            });
        }
        for ((key, values), (grad_key, grad)) in params.iter().zip(grads.iter()) {
            if key != grad_key || values.len() != grad.len() {
                return Err(TowerError::DimensionMismatch {
                    context: "gradient shape",
                    expected: values.len(),
                    actual: grad.len(),
                });
            }
        }

        optimizer.begin_step();
        for ((key, values), (_, grad)) in params.iter_mut().zip(grads) {
            optimizer.update(*key, values, grad);
        }
        Ok(())
    }
}

impl Gradients {
    /// Gradient arrays in the same order as [`EmbeddingStore::parameters`].
    pub fn entries(&self) -> Vec<(ParamKey, &[f32])> {
        let mut entries = vec![
            (ParamKey::UserTable, self.user_table.as_slice()),
            (ParamKey::ItemTable, self.item_table.as_slice()),
        ];
        for (i, layer) in self.user_tower.iter().enumerate() {
            entries.push((ParamKey::UserWeights(i), layer.weights.as_slice()));
            entries.push((ParamKey::UserBias(i), layer.bias.as_slice()));
        }
        for (i, layer) in self.item_tower.iter().enumerate() {
            entries.push((ParamKey::ItemWeights(i), layer.weights.as_slice()));
            entries.push((ParamKey::ItemBias(i), layer.bias.as_slice()));
        }
        entries
    }

    /// Adds the leading `table.ncols()` columns of each row of `rows` into
    /// the table rows named by `indices`. Repeated indices accumulate.
    pub fn scatter_add(&mut self, table: Table, indices: &[usize], rows: &DMatrix<f32>) {
        let target = match table {
            Table::User => &mut self.user_table,
            Table::Item => &mut self.item_table,
        };
        let width = target.ncols().min(rows.ncols());
        for (r, &index) in indices.iter().enumerate() {
            for c in 0..width {
                target[(index, c)] += rows[(r, c)];
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.entries()
            .iter()
            .all(|(_, values)| values.iter().all(|v| v.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::optimizer::SGD;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_store() -> EmbeddingStore {
        let mut rng = StdRng::seed_from_u64(9);
        let user_tower = Tower::multilayer(&mut rng, 4, &[3], 2).unwrap();
        let item_tower = Tower::multilayer(&mut rng, 4, &[5], 2).unwrap();
        EmbeddingStore::new(&mut rng, 3, 6, 4, 0.05, user_tower, item_tower)
    }

    #[test]
    fn test_lookup_returns_rows_in_order_without_mutation() {
        let store = small_store();
        let before = store.clone();
        let rows = store.lookup(Table::Item, &[4, 1, 4]).unwrap();
        assert_eq!(rows.shape(), (3, 4));
        for c in 0..4 {
            assert_eq!(rows[(0, c)], store.table(Table::Item)[(4, c)]);
            assert_eq!(rows[(1, c)], store.table(Table::Item)[(1, c)]);
            assert_eq!(rows[(2, c)], rows[(0, c)]);
        }
        assert_eq!(store, before);
    }

    #[test]
    fn test_lookup_single_row_matches_table() {
        let store = small_store();
        for i in 0..store.num_users() {
            let row = store.lookup(Table::User, &[i]).unwrap();
            assert_eq!(row.row(0), store.table(Table::User).row(i));
        }
    }

    #[test]
    fn test_lookup_out_of_bounds() {
        let store = small_store();
        let err = store.lookup(Table::User, &[0, 3]).unwrap_err();
        assert!(matches!(
            err,
            TowerError::IndexOutOfBounds {
                table: Table::User,
                index: 3,
                len: 3
            }
        ));
    }

    #[test]
    fn test_parameters_cover_tables_and_layers() {
        let store = small_store();
        let params = store.parameters();
        // two tables + (weights, bias) for two layers in each tower
        assert_eq!(params.len(), 2 + 4 + 4);
        assert_eq!(params[0].0, ParamKey::UserTable);
        assert_eq!(params[0].1.len(), 3 * 4);
        assert_eq!(
            store.parameter_count(),
            3 * 4 + 6 * 4 + (4 * 3 + 3 + 3 * 2 + 2) + (4 * 5 + 5 + 5 * 2 + 2)
        );
    }

    #[test]
    fn test_gradient_layout_matches_parameters() {
        let store = small_store();
        let grads = store.zero_gradients();
        let keys: Vec<ParamKey> = store.parameters().iter().map(|(k, _)| *k).collect();
        let grad_keys: Vec<ParamKey> = grads.entries().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, grad_keys);
    }

    #[test]
    fn test_scatter_add_accumulates_duplicates() {
        let store = small_store();
        let mut grads = store.zero_gradients();
        let rows = DMatrix::from_row_slice(2, 4, &[1.0, 1.0, 1.0, 1.0, 2.0, 0.0, 0.0, 0.0]);
        grads.scatter_add(Table::Item, &[5, 5], &rows);
        assert_eq!(grads.item_table[(5, 0)], 3.0);
        assert_eq!(grads.item_table[(5, 1)], 1.0);
        assert_eq!(grads.item_table[(0, 0)], 0.0);
    }

    #[test]
    fn test_apply_updates_only_through_gradients() {
        let mut store = small_store();
        let before = store.clone();
        let mut grads = store.zero_gradients();
        grads.user_table[(1, 2)] = 1.0;

        let mut sgd = SGD::new(0.5);
        store.apply(&grads, &mut sgd).unwrap();

        assert!((store.table(Table::User)[(1, 2)] - (before.table(Table::User)[(1, 2)] - 0.5)).abs() < 1e-6);
        assert_eq!(store.table(Table::Item), before.table(Table::Item));
        assert_eq!(store.tower(Table::User), before.tower(Table::User));
    }

    #[test]
    fn test_apply_rejects_foreign_gradients() {
        let mut store = small_store();
        let mut rng = StdRng::seed_from_u64(1);
        let other = EmbeddingStore::new(&mut rng, 3, 6, 4, 0.05, Tower::Identity, Tower::Identity);
        let mut sgd = SGD::new(0.1);
        assert!(store.apply(&other.zero_gradients(), &mut sgd).is_err());
    }
}
