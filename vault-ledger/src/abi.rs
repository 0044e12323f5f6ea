// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::contract::abigen;

// The subset of the vault ABI the mirror reads.
abigen!(
    Vault,
    r#"[
        event Deposited(address indexed user, uint256 amount)
        event WithdrawRequested(address indexed user, uint256 amount, uint256 unlockTime)
        function balances(address user) external view returns (uint256)
    ]"#
);
