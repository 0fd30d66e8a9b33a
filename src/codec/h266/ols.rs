// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Variables derived from a VPS: layer dependencies (7.4.3.3) and the output
//! layer sets it specifies.

use std::collections::BTreeMap;

use crate::codec::h266::vps::Vps;
use crate::codec::ParseError;

/// vps_max_layers_minus1 is coded with 6 bits.
pub const MAX_LAYERS: usize = 64;
/// vps_num_output_layer_sets_minus2 is coded with 8 bits.
pub const MAX_TOTAL_OLSS: usize = 257;

/// The OLS mode used when every layer is an OLS on its own.
const EACH_LAYER_IS_AN_OLS: u8 = 4;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DerivedVpsState {
    /// GeneralLayerIdx, keyed by nuh_layer_id.
    pub general_layer_idx: BTreeMap<u8, usize>,
    /// dependencyFlag[i][j]: layer j is a direct or indirect reference of
    /// layer i.
    pub dependency_flag: Vec<Vec<bool>>,
    pub layer_used_as_ref_layer: Vec<bool>,
    pub num_direct_ref_layers: Vec<usize>,
    pub direct_ref_layer_idx: Vec<Vec<usize>>,
    pub num_ref_layers: Vec<usize>,
    pub reference_layer_idx: Vec<Vec<usize>>,

    /// olsModeIdc, 4 when vps_each_layer_is_an_ols_flag is set.
    pub ols_mode_idc: u8,
    pub total_num_olss: usize,
    pub num_output_layers_in_ols: Vec<usize>,
    pub output_layer_id_in_ols: Vec<Vec<u8>>,
    /// Layer indices of the output layers of each OLS.
    pub output_layer_idx: Vec<Vec<usize>>,
    pub layer_used_as_output_layer: Vec<bool>,
    /// layerIncludedInOlsFlag, indexed by OLS and layer index.
    pub layer_included_in_ols: Vec<Vec<bool>>,
    /// NumSubLayersInLayerInOLS, indexed by OLS and layer index. Empty until
    /// the profile_tier_level() structures are known.
    pub num_sub_layers_in_layer_in_ols: Vec<Vec<u8>>,
    pub num_layers_in_ols: Vec<usize>,
    pub layer_id_in_ols: Vec<Vec<u8>>,
    pub num_multi_layer_olss: usize,
    /// MultiLayerOlsIdx, `None` for single layer OLSs.
    pub multi_layer_ols_idx: Vec<Option<usize>>,
    /// VpsNumDpbParams.
    pub vps_num_dpb_params: usize,
}

impl DerivedVpsState {
    /// Derives every VPS variable, including the number of sublayers of each
    /// layer in each OLS.
    pub fn compute(vps: &Vps) -> Result<Self, ParseError> {
        let mut state = Self::compute_structure(vps)?;
        state.compute_sublayers(vps)?;
        state.vps_num_dpb_params = if vps.each_layer_is_an_ols_flag {
            0
        } else {
            vps.num_dpb_params_minus1 as usize + 1
        };

        Ok(state)
    }

    /// Derives the layer dependencies and the layers of each OLS. Only needs
    /// the VPS fields up to vps_ols_output_layer_flag.
    pub fn compute_structure(vps: &Vps) -> Result<Self, ParseError> {
        let num_layers = usize::from(vps.max_layers_minus1) + 1;
        if num_layers > MAX_LAYERS || vps.layer_id.len() != num_layers {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "{} layers with {} vps_layer_id entries",
                num_layers,
                vps.layer_id.len()
            )));
        }

        if vps.direct_ref_layer_flag.len() > num_layers {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "{} rows of vps_direct_ref_layer_flag for {} layers",
                vps.direct_ref_layer_flag.len(),
                num_layers
            )));
        }

        for (i, row) in vps.direct_ref_layer_flag.iter().enumerate() {
            if row.len() > i {
                return Err(ParseError::UnsupportedDerivedRange(format!(
                    "vps_direct_ref_layer_flag[{}] has {} entries",
                    i,
                    row.len()
                )));
            }
        }

        let mut state = DerivedVpsState::default();

        for (i, &layer_id) in vps.layer_id.iter().enumerate() {
            state.general_layer_idx.insert(layer_id, i);
        }

        state.derive_dependencies(vps, num_layers);

        state.ols_mode_idc = if vps.each_layer_is_an_ols_flag {
            EACH_LAYER_IS_AN_OLS
        } else {
            vps.ols_mode_idc
        };

        if state.ols_mode_idc == 3 {
            return Err(ParseError::InvalidValue(String::from(
                "vps_ols_mode_idc 3 is reserved",
            )));
        }

        state.total_num_olss = if num_layers == 1 {
            1
        } else if state.ols_mode_idc == 2 {
            usize::from(vps.num_output_layer_sets_minus2) + 2
        } else {
            num_layers
        };

        if state.total_num_olss > MAX_TOTAL_OLSS {
            return Err(ParseError::UnsupportedDerivedRange(format!(
                "TotalNumOlss {}",
                state.total_num_olss
            )));
        }

        state.derive_output_layers(vps, num_layers)?;
        state.derive_layers_in_ols(vps);

        Ok(state)
    }

    fn derive_dependencies(&mut self, vps: &Vps, num_layers: usize) {
        let mut dependency_flag = vec![vec![false; num_layers]; num_layers];
        for i in 0..num_layers {
            for j in 0..num_layers {
                let mut dependent = direct_ref_layer(vps, i, j);
                for k in 0..i {
                    if direct_ref_layer(vps, i, k) && dependency_flag[k][j] {
                        dependent = true;
                    }
                }
                dependency_flag[i][j] = dependent;
            }
        }

        self.layer_used_as_ref_layer = vec![false; num_layers];
        for (i, dependencies) in dependency_flag.iter().enumerate() {
            let mut direct_refs = Vec::new();
            let mut refs = Vec::new();

            for (j, &dependent) in dependencies.iter().enumerate() {
                if direct_ref_layer(vps, i, j) {
                    direct_refs.push(j);
                    self.layer_used_as_ref_layer[j] = true;
                }

                if dependent {
                    refs.push(j);
                }
            }

            self.num_direct_ref_layers.push(direct_refs.len());
            self.direct_ref_layer_idx.push(direct_refs);
            self.num_ref_layers.push(refs.len());
            self.reference_layer_idx.push(refs);
        }

        self.dependency_flag = dependency_flag;
    }

    fn derive_output_layers(&mut self, vps: &Vps, num_layers: usize) -> Result<(), ParseError> {
        let mode = self.ols_mode_idc;

        self.layer_used_as_output_layer = (0..num_layers)
            .map(|i| i == 0 || mode == EACH_LAYER_IS_AN_OLS || mode < 2)
            .collect();

        // The 0-th OLS contains only the lowest layer, which is its output.
        let mut included = vec![false; num_layers];
        included[0] = true;
        self.layer_included_in_ols.push(included);
        self.output_layer_idx.push(vec![0]);

        for i in 1..self.total_num_olss {
            let mut included = vec![false; num_layers];
            let outputs = match mode {
                EACH_LAYER_IS_AN_OLS => {
                    included[i] = true;
                    vec![i]
                }
                0 => {
                    included[..=i].fill(true);
                    vec![i]
                }
                1 => {
                    included[..=i].fill(true);
                    (0..=i).collect()
                }
                _ => {
                    let flags = vps.ols_output_layer_flag.get(i).ok_or_else(|| {
                        ParseError::UnsupportedDerivedRange(format!(
                            "no vps_ols_output_layer_flag row for OLS {}",
                            i
                        ))
                    })?;

                    if flags.len() != num_layers {
                        return Err(ParseError::UnsupportedDerivedRange(format!(
                            "vps_ols_output_layer_flag[{}] has {} entries for {} layers",
                            i,
                            flags.len(),
                            num_layers
                        )));
                    }

                    let outputs: Vec<usize> = flags
                        .iter()
                        .enumerate()
                        .filter_map(|(k, &flag)| flag.then_some(k))
                        .collect();

                    for &idx in &outputs {
                        included[idx] = true;
                        self.layer_used_as_output_layer[idx] = true;
                        for &ref_idx in &self.reference_layer_idx[idx] {
                            included[ref_idx] = true;
                        }
                    }

                    outputs
                }
            };

            if outputs.is_empty() {
                return Err(ParseError::InvalidValue(format!(
                    "output layer set {} has no output layer",
                    i
                )));
            }

            self.layer_included_in_ols.push(included);
            self.output_layer_idx.push(outputs);
        }

        self.num_output_layers_in_ols = self.output_layer_idx.iter().map(Vec::len).collect();
        self.output_layer_id_in_ols = self
            .output_layer_idx
            .iter()
            .map(|outputs| outputs.iter().map(|&idx| vps.layer_id[idx]).collect())
            .collect();

        Ok(())
    }

    fn derive_layers_in_ols(&mut self, vps: &Vps) {
        self.layer_id_in_ols = self
            .layer_included_in_ols
            .iter()
            .map(|included| {
                included
                    .iter()
                    .zip(&vps.layer_id)
                    .filter_map(|(&inc, &id)| inc.then_some(id))
                    .collect()
            })
            .collect();

        self.num_layers_in_ols = self.layer_id_in_ols.iter().map(Vec::len).collect();

        let mut num_multi_layer_olss = 0;
        self.multi_layer_ols_idx = self
            .num_layers_in_ols
            .iter()
            .map(|&num_layers| {
                (num_layers > 1).then(|| {
                    num_multi_layer_olss += 1;
                    num_multi_layer_olss - 1
                })
            })
            .collect();
        self.num_multi_layer_olss = num_multi_layer_olss;
    }

    /// Derives NumSubLayersInLayerInOLS. Needs vps_ptl_max_tid and
    /// vps_ols_ptl_idx on top of what [`Self::compute_structure`] uses.
    pub fn compute_sublayers(&mut self, vps: &Vps) -> Result<(), ParseError> {
        let num_layers = self.layer_used_as_output_layer.len();
        let mut sublayers = Vec::with_capacity(self.total_num_olss);

        for i in 0..self.total_num_olss {
            let mut row = vec![0u8; num_layers];
            let top = max_sublayers_of_ols(vps, i)?;

            if i == 0 {
                row[0] = top;
            } else {
                match self.ols_mode_idc {
                    EACH_LAYER_IS_AN_OLS => row[i] = top,
                    0 => {
                        row[i] = top;
                        for k in (0..i).rev() {
                            for m in k + 1..=i {
                                let needed = row[m].min(max_tid_il_ref_pics_plus1(vps, m, k));
                                if direct_ref_layer(vps, m, k) && row[k] < needed {
                                    row[k] = needed;
                                }
                            }
                        }
                    }
                    1 => row[..=i].fill(top),
                    _ => {
                        let outputs = &self.output_layer_idx[i];
                        let included = &self.layer_included_in_ols[i];
                        for &k in outputs {
                            row[k] = top;
                        }

                        let highest = included.iter().rposition(|&inc| inc).unwrap_or(0);
                        for k in (0..highest).rev() {
                            if !included[k] || outputs.contains(&k) {
                                continue;
                            }

                            for m in k + 1..=highest {
                                let needed = row[m].min(max_tid_il_ref_pics_plus1(vps, m, k));
                                if direct_ref_layer(vps, m, k) && included[m] && row[k] < needed {
                                    row[k] = needed;
                                }
                            }
                        }
                    }
                }
            }

            sublayers.push(row);
        }

        self.num_sub_layers_in_layer_in_ols = sublayers;

        Ok(())
    }

    /// Returns GeneralLayerIdx[nuh_layer_id].
    pub fn layer_idx(&self, nuh_layer_id: u8) -> Option<usize> {
        self.general_layer_idx.get(&nuh_layer_id).copied()
    }
}

fn direct_ref_layer(vps: &Vps, i: usize, j: usize) -> bool {
    vps.direct_ref_layer_flag
        .get(i)
        .and_then(|row| row.get(j))
        .copied()
        .unwrap_or(false)
}

fn max_tid_il_ref_pics_plus1(vps: &Vps, i: usize, j: usize) -> u8 {
    vps.max_tid_il_ref_pics_plus1
        .get(i)
        .and_then(|row| row.get(j))
        .copied()
        .unwrap_or(vps.max_sublayers_minus1 + 1)
}

/// vps_ptl_max_tid[vps_ols_ptl_idx[i]] + 1
fn max_sublayers_of_ols(vps: &Vps, ols_idx: usize) -> Result<u8, ParseError> {
    let ptl_idx = vps.ols_ptl_idx.get(ols_idx).copied().ok_or_else(|| {
        ParseError::UnsupportedDerivedRange(format!("no vps_ols_ptl_idx for OLS {}", ols_idx))
    })?;

    let max_tid = vps
        .ptl_max_tid
        .get(usize::from(ptl_idx))
        .copied()
        .ok_or_else(|| {
            ParseError::UnsupportedDerivedRange(format!(
                "vps_ols_ptl_idx[{}] {} is beyond the {} signalled PTLs",
                ols_idx,
                ptl_idx,
                vps.ptl_max_tid.len()
            ))
        })?;

    if max_tid > vps.max_sublayers_minus1 {
        return Err(ParseError::UnsupportedDerivedRange(format!(
            "vps_ptl_max_tid {} above vps_max_sublayers_minus1 {}",
            max_tid, vps.max_sublayers_minus1
        )));
    }

    Ok(max_tid + 1)
}
